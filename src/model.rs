use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ValidationError;

/// Upstream `created_at` layout. Anything else is rejected.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One archived page, addressed by its capture key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRef {
    pub key: String,
    pub path: PathBuf,
}

/// Records of one fetched page, exactly as the feed returned them.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub key: String,
    pub records: Vec<Value>,
}

/// Opaque event payload, serialized once and bounded in size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(String);

impl Payload {
    pub fn new(value: &Value, limit: usize) -> Result<Self, ValidationError> {
        let text = value.to_string();
        if text.len() > limit {
            return Err(ValidationError::PayloadTooLarge {
                size: text.len(),
                limit,
            });
        }
        Ok(Payload(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub id: String,
    pub kind: String,
    pub actor: String,
    pub actor_id: Option<i64>,
    pub subject: String,
    pub subject_id: Option<i64>,
    pub visibility: bool,
    pub occurred_at: DateTime<Utc>,
    pub payload: Payload,
}

/// Canonical text form for stored timestamps; sorts chronologically.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}
