//! Source record to target row transformation.

use anyhow::{bail, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{SourceRecord, TargetRow};

/// Separator between components of a composite natural key.
pub const KEY_SEPARATOR: &str = "\u{1f}";

/// A record that cannot become a target row. Skipped and counted, never
/// fatal to the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("missing natural key field '{0}'")]
    MissingKeyField(String),
    #[error("missing required field '{0}'")]
    MissingRequiredField(String),
}

/// Maps source records to target rows keyed by a natural key.
#[derive(Debug, Clone)]
pub struct RecordTransform {
    key_fields: Vec<String>,
    required_fields: Vec<String>,
}

impl RecordTransform {
    pub fn new(key_fields: Vec<String>, required_fields: Vec<String>) -> Result<Self> {
        if key_fields.is_empty() {
            bail!("at least one natural key field is required");
        }
        Ok(Self {
            key_fields,
            required_fields,
        })
    }

    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    /// The record's natural key: key field values joined by
    /// [`KEY_SEPARATOR`]. Null and empty values count as missing.
    pub fn natural_key(&self, record: &SourceRecord) -> Result<String, DataError> {
        let mut parts = Vec::with_capacity(self.key_fields.len());
        for field in &self.key_fields {
            match record.fields.get(field).and_then(scalar_text) {
                Some(text) => parts.push(text),
                None => return Err(DataError::MissingKeyField(field.clone())),
            }
        }
        Ok(parts.join(KEY_SEPARATOR))
    }

    pub fn apply(&self, record: &SourceRecord) -> Result<TargetRow, DataError> {
        let natural_key = self.natural_key(record)?;

        for field in &self.required_fields {
            let present = record.fields.get(field).is_some_and(|v| !is_blank(v));
            if !present {
                return Err(DataError::MissingRequiredField(field.clone()));
            }
        }

        let payload_json = Value::Object(record.fields.clone()).to_string();

        let mut hasher = Sha256::new();
        hasher.update(natural_key.as_bytes());
        hasher.update(record.timestamp.timestamp_micros().to_le_bytes());
        hasher.update(payload_json.as_bytes());
        let payload_hash = format!("{:x}", hasher.finalize());

        Ok(TargetRow {
            natural_key,
            record_ts: record.timestamp,
            payload_json,
            payload_hash,
        })
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
