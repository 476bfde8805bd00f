use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Why a single feed request did not yield a usable page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transient(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by upstream (resets at {})", describe_reset(.reset_at))]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("upstream returned HTTP {status}")]
    Upstream { status: u16, body: String },

    #[error("HTTP {status} body is not a JSON array: {source}")]
    MalformedBody {
        status: u16,
        #[source]
        source: serde_json::Error,
    },
}

fn describe_reset(reset_at: &Option<DateTime<Utc>>) -> String {
    match reset_at {
        Some(t) => t.to_rfc3339(),
        None => "unknown".to_string(),
    }
}

/// A raw record that cannot become a stored record.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unparseable timestamp {value:?}: {source}")]
    BadTimestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Write or read failure against the raw archive or the structured store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archived page {path:?} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}
