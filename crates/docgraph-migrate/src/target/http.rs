//! EdgeDB target over the EdgeQL HTTP endpoint.
//!
//! Every request runs in its own implicit transaction. A [`Transaction`]
//! therefore buffers its statements and commits them as a single composed
//! statement, so the whole batch is applied or none of it is.
//!
//! Writes are re-sent only when the request never reached the server.
//! Read-only queries follow the configured retry policy.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{TargetStore, Transaction, Vars};
use crate::error::{Error, Result};
use crate::retry::{is_unsent, with_retry, with_retry_if, RetryPolicy};
use crate::transport::{create_http_client, status_error, validate_url, Side};

/// Configuration for the EdgeQL HTTP target.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeHttpConfig {
    /// Server base URL, e.g. `http://localhost:10701`.
    pub url: String,
    /// Database (branch) name.
    #[serde(default = "default_database")]
    pub database: String,
    /// User for basic authentication.
    #[serde(default)]
    pub user: Option<String>,
    /// Password for basic authentication.
    #[serde(default)]
    pub password: Option<String>,
    /// Backoff for transport failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_database() -> String {
    "edgedb".to_string()
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
    variables: &'a Vars,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    data: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    error: Option<QueryError>,
}

#[derive(Deserialize)]
struct QueryError {
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// Client half shared by the store and its transactions.
#[derive(Clone)]
struct Endpoint {
    client: Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    retry: RetryPolicy,
}

impl Endpoint {
    async fn post(&self, query: &str, vars: &Vars) -> Result<Vec<serde_json::Value>> {
        let mut request = self.client.post(&self.url).json(&QueryRequest {
            query,
            variables: vars,
        });
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        // Query errors arrive as a JSON body, often with a 4xx status.
        if let Ok(parsed) = serde_json::from_str::<QueryResponse>(&body) {
            if let Some(err) = parsed.error {
                return Err(Error::Execution(match err.kind {
                    Some(kind) => format!("{kind}: {}", err.message),
                    None => err.message,
                }));
            }
            if status.is_success() {
                return Ok(parsed.data.unwrap_or_default());
            }
        }
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &body, Side::Target));
        }
        Err(Error::TargetConnection(format!(
            "unexpected response body: {body}"
        )))
    }

    async fn write(&self, query: &str, vars: &Vars) -> Result<Vec<serde_json::Value>> {
        debug!("POST {} ({} variables)", self.url, vars.len());
        with_retry_if(&self.retry, "edgeql write", is_unsent, || {
            self.post(query, vars)
        })
        .await
    }
}

/// EdgeDB store reached over HTTP.
pub struct EdgeHttpStore {
    endpoint: Endpoint,
}

impl EdgeHttpStore {
    /// Creates a store for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a non-HTTP URL or an empty database name.
    pub fn new(config: EdgeHttpConfig) -> Result<Self> {
        validate_url(&config.url)?;
        if config.database.is_empty() {
            return Err(Error::Config("database cannot be empty".to_string()));
        }
        let url = format!(
            "{}/db/{}/edgeql",
            config.url.trim_end_matches('/'),
            config.database
        );
        Ok(Self {
            endpoint: Endpoint {
                client: create_http_client(),
                url,
                user: config.user,
                password: config.password,
                retry: config.retry,
            },
        })
    }
}

#[async_trait]
impl TargetStore for EdgeHttpStore {
    fn store_type(&self) -> &'static str {
        "edgedb_http"
    }

    async fn execute(&self, query: &str, vars: &Vars) -> Result<Vec<serde_json::Value>> {
        self.endpoint.write(query, vars).await
    }

    async fn query(&self, query: &str, vars: &Vars) -> Result<Vec<serde_json::Value>> {
        debug!("POST {} ({} variables)", self.endpoint.url, vars.len());
        with_retry(&self.endpoint.retry, "edgeql query", || {
            self.endpoint.post(query, vars)
        })
        .await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(EdgeHttpTransaction {
            endpoint: self.endpoint.clone(),
            pending: Vec::new(),
        }))
    }
}

struct EdgeHttpTransaction {
    endpoint: Endpoint,
    pending: Vec<(String, Vars)>,
}

#[async_trait]
impl Transaction for EdgeHttpTransaction {
    /// Buffers the statement. Its errors surface on commit.
    async fn execute(&mut self, query: &str, vars: &Vars) -> Result<Vec<serde_json::Value>> {
        self.pending.push((query.to_string(), vars.clone()));
        Ok(Vec::new())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let (query, vars) = compose(&self.pending);
        info!(
            "Committing {} statements as one request",
            self.pending.len()
        );
        self.endpoint.write(&query, &vars).await.map_err(|e| {
            Error::Transaction(format!(
                "{} statements rolled back: {e}",
                self.pending.len()
            ))
        })?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!("discarding {} buffered statements", self.pending.len());
        Ok(())
    }
}

/// Binds each statement to its own `with` alias and selects every alias,
/// so all of them run in one implicit transaction. Variables are prefixed
/// per statement to keep them apart.
pub(crate) fn compose(statements: &[(String, Vars)]) -> (String, Vars) {
    let mut bindings = Vec::with_capacity(statements.len());
    let mut aliases = Vec::with_capacity(statements.len());
    let mut vars = Vars::new();
    for (i, (query, own)) in statements.iter().enumerate() {
        let prefix = format!("s{i}_");
        let body = prefix_params(query.trim().trim_end_matches(';'), own, &prefix);
        bindings.push(format!("    s{i} := ({body})"));
        aliases.push(format!("s{i} := count(s{i})"));
        vars.extend(
            own.iter()
                .map(|(name, value)| (format!("{prefix}{name}"), value.clone())),
        );
    }
    let query = format!(
        "with\n{}\nselect {{ {} }}",
        bindings.join(",\n"),
        aliases.join(", ")
    );
    (query, vars)
}

/// Renames `$name` parameters declared in `vars` to `$<prefix>name`,
/// leaving string literals and comments untouched.
fn prefix_params(query: &str, vars: &Vars, prefix: &str) -> String {
    let mut out = String::with_capacity(query.len() + prefix.len() * vars.len());
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        match c {
            '\'' | '"' => {
                while let Some(inner) = chars.next() {
                    out.push(inner);
                    if inner == '\\' {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    } else if inner == c {
                        break;
                    }
                }
            }
            '#' => {
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '$' => {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if vars.contains_key(&name) {
                    out.push_str(prefix);
                }
                out.push_str(&name);
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
