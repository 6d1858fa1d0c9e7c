//! Source abstraction: a restartable, time-filtered reader over records.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};

use crate::models::{Interval, SourceRecord};

/// Lazy stream of records for one interval.
pub type RecordStream = BoxStream<'static, Result<SourceRecord>>;

/// Lazy stream of every row's parsed timestamp (`None` when unparseable).
pub type TimestampStream = BoxStream<'static, Result<Option<DateTime<Utc>>>>;

/// A time-series dataset the engine can read from.
///
/// Implementations must be restartable and deterministic: streaming the
/// same interval twice yields the same records in the same order. The
/// engine relies on this to resume a batch at a record offset.
#[async_trait]
pub trait Source: Send + Sync {
    /// Human-readable identifier (file path, table name).
    fn describe(&self) -> String;

    /// Total number of raw rows, including ones with bad timestamps.
    async fn count(&self) -> Result<u64>;

    /// Timestamps of every raw row, for density analysis.
    async fn scan_timestamps(&self) -> Result<TimestampStream>;

    /// Records whose timestamp falls in `interval`, in source order.
    async fn stream(&self, interval: Interval) -> Result<RecordStream>;
}

/// One raw row held by [`MemorySource`].
#[derive(Debug, Clone)]
pub struct MemoryRow {
    pub timestamp: Option<DateTime<Utc>>,
    pub fields: Map<String, Value>,
}

/// In-memory source for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    rows: Vec<MemoryRow>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, timestamp: Option<DateTime<Utc>>, fields: Map<String, Value>) {
        self.rows.push(MemoryRow { timestamp, fields });
    }

    pub fn with_rows(rows: Vec<MemoryRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl Source for MemorySource {
    fn describe(&self) -> String {
        format!("memory ({} rows)", self.rows.len())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.rows.len() as u64)
    }

    async fn scan_timestamps(&self) -> Result<TimestampStream> {
        let stamps: Vec<_> = self.rows.iter().map(|r| Ok(r.timestamp)).collect();
        Ok(stream::iter(stamps).boxed())
    }

    async fn stream(&self, interval: Interval) -> Result<RecordStream> {
        let records: Vec<_> = self
            .rows
            .iter()
            .filter_map(|r| {
                let ts = r.timestamp?;
                interval.contains(&ts).then(|| {
                    Ok(SourceRecord {
                        timestamp: ts,
                        fields: r.fields.clone(),
                    })
                })
            })
            .collect();
        Ok(stream::iter(records).boxed())
    }
}
