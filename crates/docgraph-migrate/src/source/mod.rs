//! Record sources: where documents are read from.

pub mod firestore;
pub mod json_file;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{CollectionRules, FetchOrder, SourceConfig};
use crate::diagnostics::create_progress_bar;
use crate::error::{Error, Result};
use crate::record::{Record, Value};

/// Field holding the document id.
pub const ID_FIELD: &str = "id";
/// Field holding the document creation time.
pub const CREATE_TIME_FIELD: &str = "create_time";
/// Field holding the last document update time.
pub const UPDATE_TIME_FIELD: &str = "update_time";
/// Field holding the document path as a sequence of segments.
pub const PATH_FIELD: &str = "_path";

/// Position in an ordered fetch. The next page starts after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    /// Path of the last document, e.g. `["events", "e1", "payments", "p1"]`.
    pub path: Vec<String>,
    /// Value of the order field in the last document.
    pub order_value: Option<Value>,
}

impl Cursor {
    /// Builds the cursor positioned on `record`.
    #[must_use]
    pub fn after(record: &Record, order: Option<&FetchOrder>) -> Option<Self> {
        let path = record
            .get(PATH_FIELD)?
            .as_array()?
            .iter()
            .map(ToString::to_string)
            .collect();
        Some(Self {
            path,
            order_value: order.map(|o| record.get(&o.field).cloned().unwrap_or_default()),
        })
    }
}

/// One fetch call.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    /// Collection name, or collection id for a group fetch.
    pub collection: String,
    /// Fetch every sub-collection with this id.
    pub collection_group: bool,
    /// Sort order. Documents lacking the field are not returned.
    pub order: Option<FetchOrder>,
    /// Maximum number of documents.
    pub limit: Option<usize>,
    /// Start after this position.
    pub start_after: Option<Cursor>,
}

impl FetchRequest {
    /// Unordered, unlimited request.
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            collection_group: false,
            order: None,
            limit: None,
            start_after: None,
        }
    }

    /// Request shaped by a collection's rules.
    #[must_use]
    pub fn for_collection(collection: &str, rules: &CollectionRules) -> Self {
        Self {
            collection_group: rules.collection_group,
            order: Some(rules.fetch_order.clone()),
            ..Self::new(collection)
        }
    }

    /// Sets the limit.
    #[must_use]
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the start position.
    #[must_use]
    pub fn with_start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }

    /// Rejects a start position without an order field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`].
    pub fn check(&self) -> Result<()> {
        if self.start_after.is_some() && self.order.is_none() {
            return Err(Error::Config(
                "start_after requires an order field".to_string(),
            ));
        }
        Ok(())
    }
}

/// One page of fetched documents.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    /// Enriched documents, in fetch order.
    pub records: Vec<Record>,
    /// Position after the last document, if any.
    pub cursor: Option<Cursor>,
}

impl FetchPage {
    /// Wraps fetched records, positioning the cursor on the last one.
    #[must_use]
    pub fn new(records: Vec<Record>, order: Option<&FetchOrder>) -> Self {
        let cursor = records.last().and_then(|r| Cursor::after(r, order));
        Self { records, cursor }
    }
}

/// A document store documents are read from.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Source type name, for logs.
    fn source_type(&self) -> &'static str;

    /// Connect to the source and validate configuration.
    async fn connect(&mut self) -> Result<()>;

    /// Fetch one page of documents.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchPage>;

    /// Count documents matching the request, ignoring its limit.
    async fn count(&self, request: &FetchRequest) -> Result<usize>;

    /// Look a document key up and return the cursor positioned on it.
    /// For a collection group, the key is the document path below the root.
    async fn resolve_start_after(&self, request: &FetchRequest, key: &str) -> Result<Cursor>;

    /// Close the connection and cleanup resources.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Create a record source from configuration.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn create_source(config: &SourceConfig) -> Result<Box<dyn RecordSource>> {
    match config {
        SourceConfig::JsonFile(cfg) => Ok(Box::new(json_file::JsonFileSource::new(cfg.clone()))),
        SourceConfig::Firestore(cfg) => {
            Ok(Box::new(firestore::FirestoreSource::new(cfg.clone())?))
        }
    }
}

/// Appends the document id, timestamps and path to the document fields.
#[must_use]
pub fn enrich(
    mut fields: Record,
    id: &str,
    create_time: Value,
    update_time: Value,
    path: &[String],
) -> Record {
    fields.insert(ID_FIELD.to_string(), Value::from(id));
    fields.insert(CREATE_TIME_FIELD.to_string(), create_time);
    fields.insert(UPDATE_TIME_FIELD.to_string(), update_time);
    fields.insert(
        PATH_FIELD.to_string(),
        Value::Array(path.iter().map(|s| Value::from(s.as_str())).collect()),
    );
    fields
}

/// Fetches every document matching `request`, one page at a time, until a
/// short page. The fetched total is checked against a count taken first;
/// a mismatch usually means some documents lack the order field.
///
/// # Errors
///
/// Returns [`Error::Config`] for a zero page size or a start position
/// without an order field, and propagates source errors.
pub async fn fetch_all(
    source: &dyn RecordSource,
    request: &FetchRequest,
    page_size: usize,
) -> Result<Vec<Record>> {
    if page_size == 0 {
        return Err(Error::Config("page_size must be greater than 0".to_string()));
    }
    request.check()?;

    let expected = source.count(request).await?;
    info!(
        "fetch_all: Start fetching {} documents from {}...",
        expected, request.collection
    );
    if let Some(order) = &request.order {
        info!("fetch_all: Ordering by {}, {:?}.", order.field, order.direction);
    }

    let progress = create_progress_bar(expected as u64, "fetch");
    let mut records = Vec::with_capacity(expected);
    let mut cursor = request.start_after.clone();
    let mut page_no = 0usize;
    loop {
        let page_request = request
            .clone()
            .with_limit(Some(page_size))
            .with_start_after(cursor.take());
        let page = source.fetch(&page_request).await?;
        let fetched = page.records.len();
        records.extend(page.records);
        progress.inc(fetched as u64);
        debug!(
            "fetch_all: Fetched {} documents in page {}, {} so far.",
            fetched,
            page_no,
            records.len()
        );
        page_no += 1;

        if fetched < page_size {
            break;
        }
        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    progress.finish_and_clear();

    if records.len() == expected {
        info!(
            "fetch_all: Finished fetching {} documents, expected to find {}.",
            records.len(),
            expected
        );
    } else {
        warn!(
            "fetch_all: Expected to find {} documents, but found {}. The order field may not be defined for all documents.",
            expected,
            records.len()
        );
    }
    Ok(records)
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
