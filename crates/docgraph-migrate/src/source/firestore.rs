//! Firestore source over the REST API.
//!
//! Documents are read with `runQuery` and counted with
//! `runAggregationQuery`. Typed field values are decoded into [`Value`];
//! `timestampValue` becomes a native timestamp.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{enrich, Cursor, FetchPage, FetchRequest, RecordSource};
use crate::config::Direction;
use crate::error::{Error, Result};
use crate::normalize::format_rfc3339;
use crate::record::{Record, Timestamp, Value};
use crate::retry::{with_retry, RetryPolicy};
use crate::transport::{create_http_client, status_error, validate_url, Side};

/// Configuration for the Firestore source.
#[derive(Debug, Clone, Deserialize)]
pub struct FirestoreConfig {
    /// Google Cloud project id.
    pub project_id: String,
    /// Database id.
    #[serde(default = "default_database")]
    pub database: String,
    /// OAuth2 bearer token. Not needed against the emulator.
    #[serde(default)]
    pub token: Option<String>,
    /// API base URL; point it at the emulator for local runs.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Backoff for transport failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_database() -> String {
    "(default)".to_string()
}

fn default_base_url() -> String {
    "https://firestore.googleapis.com".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    name: String,
    #[serde(default)]
    fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    create_time: Option<String>,
    #[serde(default)]
    update_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    #[serde(default)]
    document: Option<Document>,
}

/// Firestore source.
pub struct FirestoreSource {
    config: FirestoreConfig,
    client: Client,
    /// `projects/{p}/databases/{d}/documents`
    root: String,
}

impl FirestoreSource {
    /// Creates a new Firestore source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a non-HTTP base URL or an empty project id.
    pub fn new(config: FirestoreConfig) -> Result<Self> {
        validate_url(&config.base_url)?;
        if config.project_id.is_empty() {
            return Err(Error::Config("project_id cannot be empty".to_string()));
        }
        let root = format!(
            "projects/{}/databases/{}/documents",
            config.project_id, config.database
        );
        Ok(Self {
            config,
            client: create_http_client(),
            root,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/v1/{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.root,
            suffix
        )
    }

    async fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::SourceConnection(format!("request failed: {e}")))?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &text, Side::Source));
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::Extraction(format!("unexpected response body: {e}")))
    }

    async fn post(&self, label: &str, suffix: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = self.url(suffix);
        debug!("POST {}", url);
        with_retry(&self.config.retry, label, || {
            self.call(Method::POST, &url, Some(&body))
        })
        .await
    }

    /// Builds the `structuredQuery` for a request.
    fn structured_query(&self, request: &FetchRequest, with_limit: bool) -> Result<serde_json::Value> {
        let direction = match request.order.as_ref().map(|o| o.direction) {
            Some(Direction::Descending) => "DESCENDING",
            _ => "ASCENDING",
        };
        let mut order_by = Vec::new();
        if let Some(order) = &request.order {
            order_by.push(json!({"field": {"fieldPath": order.field}, "direction": direction}));
        }
        order_by.push(json!({"field": {"fieldPath": "__name__"}, "direction": direction}));

        let mut query = json!({
            "from": [{
                "collectionId": request.collection,
                "allDescendants": request.collection_group,
            }],
            "orderBy": order_by,
        });
        if let Some(cursor) = &request.start_after {
            let mut values = Vec::new();
            if request.order.is_some() {
                values.push(encode_value(cursor.order_value.as_ref().unwrap_or(&Value::Null))?);
            }
            values.push(json!({
                "referenceValue": format!("{}/{}", self.root, cursor.path.join("/"))
            }));
            query["startAt"] = json!({"values": values, "before": false});
        }
        if with_limit {
            if let Some(limit) = request.limit {
                query["limit"] = json!(limit);
            }
        }
        Ok(query)
    }

    fn decode_document(&self, doc: Document) -> Result<Record> {
        let relative = doc
            .name
            .strip_prefix(&self.root)
            .map(|p| p.trim_start_matches('/'))
            .ok_or_else(|| {
                Error::Extraction(format!("document `{}` is outside {}", doc.name, self.root))
            })?;
        let path: Vec<String> = relative.split('/').map(str::to_string).collect();
        let id = path.last().cloned().unwrap_or_default();

        let fields = doc
            .fields
            .iter()
            .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
            .collect::<Result<Record>>()?;
        let create_time = doc.create_time.as_deref().map(parse_timestamp).transpose()?;
        let update_time = doc.update_time.as_deref().map(parse_timestamp).transpose()?;
        Ok(enrich(
            fields,
            &id,
            create_time.unwrap_or_default(),
            update_time.unwrap_or_default(),
            &path,
        ))
    }
}

#[async_trait]
impl RecordSource for FirestoreSource {
    fn source_type(&self) -> &'static str {
        "firestore"
    }

    async fn connect(&mut self) -> Result<()> {
        info!(
            "Using Firestore project {} (database {}) at {}",
            self.config.project_id, self.config.database, self.config.base_url
        );
        Ok(())
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchPage> {
        request.check()?;
        let query = self.structured_query(request, true)?;
        let response = self
            .post("firestore runQuery", ":runQuery", json!({"structuredQuery": query}))
            .await?;
        let items: Vec<RunQueryItem> = serde_json::from_value(response)
            .map_err(|e| Error::Extraction(format!("unexpected runQuery response: {e}")))?;
        let records = items
            .into_iter()
            .filter_map(|item| item.document)
            .map(|doc| self.decode_document(doc))
            .collect::<Result<Vec<_>>>()?;
        debug!("runQuery on {} returned {} documents", request.collection, records.len());
        Ok(FetchPage::new(records, request.order.as_ref()))
    }

    async fn count(&self, request: &FetchRequest) -> Result<usize> {
        request.check()?;
        let query = self.structured_query(request, false)?;
        let body = json!({
            "structuredAggregationQuery": {
                "structuredQuery": query,
                "aggregations": [{"alias": "count", "count": {}}],
            }
        });
        let response = self
            .post("firestore runAggregationQuery", ":runAggregationQuery", body)
            .await?;
        let count = response
            .as_array()
            .into_iter()
            .flatten()
            .find_map(|item| item.pointer("/result/aggregateFields/count"))
            .ok_or_else(|| Error::Extraction("aggregation response has no count".to_string()))?;
        match decode_value(count)? {
            Value::Int(n) => usize::try_from(n)
                .map_err(|_| Error::Extraction(format!("invalid document count {n}"))),
            other => Err(Error::Extraction(format!(
                "document count is a {}",
                other.type_name()
            ))),
        }
    }

    async fn resolve_start_after(&self, request: &FetchRequest, key: &str) -> Result<Cursor> {
        info!(
            "start_after: interpreting \"{}\" as document key and retrieving it from {}...",
            key, request.collection
        );
        let suffix = if request.collection_group {
            format!("/{key}")
        } else {
            format!("/{}/{key}", request.collection)
        };
        let url = self.url(&suffix);
        let response = with_retry(&self.config.retry, "firestore get", || {
            self.call(Method::GET, &url, None)
        })
        .await
        .map_err(|e| match e {
            Error::SourceConnection(msg) if msg.starts_with("HTTP 404") => {
                Error::Extraction(format!("start_after document `{key}` not found"))
            }
            other => other,
        })?;
        let doc: Document = serde_json::from_value(response)
            .map_err(|e| Error::Extraction(format!("unexpected document response: {e}")))?;
        let record = self.decode_document(doc)?;
        Cursor::after(&record, request.order.as_ref())
            .ok_or_else(|| Error::Extraction(format!("start_after document `{key}` has no path")))
    }
}

fn parse_timestamp(s: &str) -> Result<Value> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| Value::Timestamp(Timestamp::Precise(dt.with_timezone(&Utc))))
        .map_err(|e| Error::Type(format!("invalid timestamp '{s}': {e}")))
}

/// Decodes one typed Firestore value.
///
/// # Errors
///
/// Returns [`Error::Type`] for an unknown or malformed value.
pub fn decode_value(value: &serde_json::Value) -> Result<Value> {
    let malformed = || Error::Type(format!("malformed Firestore value: {value}"));
    let serde_json::Value::Object(typed) = value else {
        return Err(malformed());
    };
    let Some((kind, inner)) = typed.iter().next() else {
        return Err(malformed());
    };
    Ok(match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" => Value::Bool(inner.as_bool().ok_or_else(malformed)?),
        "integerValue" => match inner {
            serde_json::Value::String(s) => Value::Int(s.parse().map_err(|_| malformed())?),
            other => Value::Int(other.as_i64().ok_or_else(malformed)?),
        },
        "doubleValue" => match inner {
            serde_json::Value::String(s) => match s.as_str() {
                "NaN" => Value::Float(f64::NAN),
                "Infinity" => Value::Float(f64::INFINITY),
                "-Infinity" => Value::Float(f64::NEG_INFINITY),
                _ => return Err(malformed()),
            },
            other => Value::Float(other.as_f64().ok_or_else(malformed)?),
        },
        "timestampValue" => parse_timestamp(inner.as_str().ok_or_else(malformed)?)?,
        "stringValue" | "bytesValue" | "referenceValue" => {
            Value::String(inner.as_str().ok_or_else(malformed)?.to_string())
        }
        "geoPointValue" => {
            let mut point = Record::new();
            for axis in ["latitude", "longitude"] {
                point.insert(
                    axis.to_string(),
                    Value::Float(inner.get(axis).and_then(serde_json::Value::as_f64).unwrap_or(0.0)),
                );
            }
            Value::Map(point)
        }
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(serde_json::Value::as_array)
                .map(|items| items.iter().map(decode_value).collect::<Result<_>>())
                .transpose()?
                .unwrap_or_default(),
        ),
        "mapValue" => Value::Map(
            inner
                .get("fields")
                .and_then(serde_json::Value::as_object)
                .map(|fields| {
                    fields
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
                        .collect::<Result<Record>>()
                })
                .transpose()?
                .unwrap_or_default(),
        ),
        _ => return Err(malformed()),
    })
}

/// Encodes a value as a typed Firestore value, for query cursors.
///
/// # Errors
///
/// Returns an error if a timestamp is out of range.
pub fn encode_value(value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => json!({"nullValue": null}),
        Value::Bool(b) => json!({"booleanValue": b}),
        Value::Int(i) => json!({"integerValue": i.to_string()}),
        Value::Float(f) if f.is_nan() => json!({"doubleValue": "NaN"}),
        Value::Float(f) => json!({"doubleValue": f}),
        Value::String(s) => json!({"stringValue": s}),
        Value::Timestamp(ts) => json!({"timestampValue": format_rfc3339(&ts.to_utc()?)}),
        Value::Array(items) => json!({
            "arrayValue": {"values": items.iter().map(encode_value).collect::<Result<Vec<_>>>()?}
        }),
        Value::Map(map) => {
            let fields = map
                .iter()
                .map(|(k, v)| Ok((k.clone(), encode_value(v)?)))
                .collect::<Result<serde_json::Map<_, _>>>()?;
            json!({"mapValue": {"fields": fields}})
        }
    })
}

#[cfg(test)]
#[path = "firestore_tests.rs"]
mod tests;
