//! JSON Lines file source: one JSON object per line.
//!
//! Blank lines are ignored. A line that is not a JSON object counts as a row
//! without a usable timestamp, like a CSV row with a bad date.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use backfill_harness_core::models::{Interval, SourceRecord};
use backfill_harness_core::source::{RecordStream, Source, TimestampStream};

use crate::sources::{blocking_stream, timestamp_of};

pub struct JsonlSource {
    path: PathBuf,
    timestamp_field: String,
}

impl JsonlSource {
    pub fn new(path: PathBuf, timestamp_field: String) -> Self {
        Self {
            path,
            timestamp_field,
        }
    }
}

fn for_each_row<F>(path: &Path, timestamp_field: &str, mut visit: F) -> Result<()>
where
    F: FnMut(Option<DateTime<Utc>>, Map<String, Value>) -> bool,
{
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    for (n, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (ts, fields) = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(fields)) => {
                let ts = fields.get(timestamp_field).and_then(timestamp_of);
                (ts, fields)
            }
            Ok(_) => {
                tracing::debug!(path = %path.display(), line = n + 1, "jsonl line is not an object");
                (None, Map::new())
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), line = n + 1, error = %e, "malformed jsonl line");
                (None, Map::new())
            }
        };
        if !visit(ts, fields) {
            return Ok(());
        }
    }
    Ok(())
}

#[async_trait]
impl Source for JsonlSource {
    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }

    async fn count(&self) -> Result<u64> {
        let path = self.path.clone();
        let field = self.timestamp_field.clone();
        tokio::task::spawn_blocking(move || {
            let mut n = 0u64;
            for_each_row(&path, &field, |_, _| {
                n += 1;
                true
            })?;
            Ok(n)
        })
        .await?
    }

    async fn scan_timestamps(&self) -> Result<TimestampStream> {
        let path = self.path.clone();
        let field = self.timestamp_field.clone();
        Ok(blocking_stream(move |emit| {
            for_each_row(&path, &field, |ts, _| emit.send(Ok(ts)))
        }))
    }

    async fn stream(&self, interval: Interval) -> Result<RecordStream> {
        let path = self.path.clone();
        let field = self.timestamp_field.clone();
        Ok(blocking_stream(move |emit| {
            for_each_row(&path, &field, |ts, fields| match ts {
                Some(timestamp) if interval.contains(&timestamp) => {
                    emit.send(Ok(SourceRecord { timestamp, fields }))
                }
                _ => true,
            })
        }))
    }
}
