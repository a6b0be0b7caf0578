//! Target store drivers.
//!
//! The pipeline talks to the target store only through [`TargetStore`]:
//! parameterized `execute` and an explicit transaction handle. The handle
//! is created once per run and passed to every phase that needs it.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::config::TargetConfig;
use crate::error::Result;

/// Named query variables.
pub type Vars = IndexMap<String, serde_json::Value>;

/// A target store accepting parameterized statements.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Store type name, for logs.
    fn store_type(&self) -> &'static str;

    /// Executes one statement and returns its result rows.
    async fn execute(&self, query: &str, vars: &Vars) -> Result<Vec<serde_json::Value>>;

    /// Runs a read-only query. Stores may retry it where they would not
    /// retry a write.
    async fn query(&self, query: &str, vars: &Vars) -> Result<Vec<serde_json::Value>> {
        self.execute(query, vars).await
    }

    /// Opens a transaction. Nothing executed through it is visible until
    /// [`Transaction::commit`].
    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>>;

    /// Releases the connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// An open transaction.
#[async_trait]
pub trait Transaction: Send {
    /// Executes one statement inside the transaction.
    async fn execute(&mut self, query: &str, vars: &Vars) -> Result<Vec<serde_json::Value>>;

    /// Makes every statement visible.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards every statement.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Create a target store from configuration.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn create_store(config: &TargetConfig) -> Result<Box<dyn TargetStore>> {
    match config {
        TargetConfig::EdgeHttp(cfg) => Ok(Box::new(http::EdgeHttpStore::new(cfg.clone())?)),
        TargetConfig::Memory => Ok(Box::new(memory::MemoryStore::new())),
    }
}
