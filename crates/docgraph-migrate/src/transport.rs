//! Shared HTTP plumbing for the remote source and target stores.

use std::time::Duration;

use reqwest::Client;

use crate::error::{Error, Result};

/// Default HTTP timeout for every request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Which side of the migration a remote call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The document store.
    Source,
    /// The graph-relational store.
    Target,
}

/// Creates a configured HTTP client with timeout.
#[must_use]
pub fn create_http_client() -> Client {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Checks that a base URL uses an HTTP scheme.
///
/// # Errors
///
/// Returns [`Error::Config`] for any other scheme.
pub fn validate_url(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "invalid URL '{url}': expected an http:// or https:// URL"
        )))
    }
}

/// Maps a non-success HTTP status to an error.
#[must_use]
pub fn status_error(status: u16, body: &str, side: Side) -> Error {
    match status {
        429 => Error::RateLimit(60),
        401 | 403 => Error::Authentication(format!("HTTP {status}: {body}")),
        _ => match side {
            Side::Source => Error::SourceConnection(format!("HTTP {status}: {body}")),
            Side::Target => Error::TargetConnection(format!("HTTP {status}: {body}")),
        },
    }
}
