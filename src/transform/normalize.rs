use std::collections::HashSet;

use chrono::NaiveDateTime;
use serde_json::Value;

use crate::error::ValidationError;
use crate::model::{NormalizedRecord, Payload, TIMESTAMP_FORMAT};

/// What to do with one raw record before the store is consulted.
#[derive(Debug)]
pub enum Disposition {
    Accept(NormalizedRecord),
    /// Kind outside the allow-set; routine, not a problem.
    Filtered,
    Invalid {
        id: Option<String>,
        error: ValidationError,
    },
}

pub fn normalize(raw: &Value, kinds: &HashSet<String>, max_payload_bytes: usize) -> Disposition {
    let kind = match text(raw.get("type")) {
        Some(k) if kinds.contains(&k) => k,
        _ => return Disposition::Filtered,
    };
    let id = text(raw.get("id"));
    match build(raw, id.clone(), kind, max_payload_bytes) {
        Ok(record) => Disposition::Accept(record),
        Err(error) => Disposition::Invalid { id, error },
    }
}

fn build(
    raw: &Value,
    id: Option<String>,
    kind: String,
    max_payload_bytes: usize,
) -> Result<NormalizedRecord, ValidationError> {
    let actor = raw.get("actor");
    let subject = raw.get("repo");

    let id = id.ok_or(ValidationError::MissingField("id"))?;
    let actor_login = text(actor.and_then(|a| a.get("login")))
        .ok_or(ValidationError::MissingField("actor"))?;
    let subject_name = text(subject.and_then(|s| s.get("name")))
        .ok_or(ValidationError::MissingField("subject"))?;
    let created_at = text(raw.get("created_at"))
        .ok_or(ValidationError::MissingField("occurred_at"))?;

    let occurred_at = NaiveDateTime::parse_from_str(&created_at, TIMESTAMP_FORMAT)
        .map_err(|source| ValidationError::BadTimestamp {
            value: created_at.clone(),
            source,
        })?
        .and_utc();

    let payload = match raw.get("payload") {
        Some(p) if !p.is_null() => Payload::new(p, max_payload_bytes)?,
        _ => Payload::new(&Value::Object(Default::default()), max_payload_bytes)?,
    };

    Ok(NormalizedRecord {
        id,
        kind,
        actor: actor_login,
        actor_id: actor.and_then(|a| a.get("id")).and_then(Value::as_i64),
        subject: subject_name,
        subject_id: subject.and_then(|s| s.get("id")).and_then(Value::as_i64),
        visibility: raw.get("public").and_then(Value::as_bool).unwrap_or(true),
        occurred_at,
        payload,
    })
}

/// Non-empty string, or a number rendered as one. Anything else counts as absent.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
