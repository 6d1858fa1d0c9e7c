//! Core data models used throughout Backfill Harness.
//!
//! These types describe the records that flow from a source into the target
//! store, the batches the planner cuts a dataset into, and the per-batch
//! progress records the engine persists.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::period;

/// One row read from a time-series source.
///
/// Sources only yield records whose timestamp parsed; rows with missing or
/// malformed timestamps are visible to the distribution analyzer as
/// exclusions and never reach the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

/// Persisted representation of a record in the target store.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRow {
    pub natural_key: String,
    pub record_ts: DateTime<Utc>,
    pub payload_json: String,
    pub payload_hash: String,
}

/// Partition granularity of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Month,
    Week,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Month => "month",
            Granularity::Week => "week",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "month" => Ok(Granularity::Month),
            "week" => Ok(Granularity::Week),
            other => bail!("unknown granularity: '{}'", other),
        }
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Every timestamp on or after `floor` (or every timestamp at all).
    pub fn from_floor(floor: Option<NaiveDate>) -> Self {
        let start = floor
            .map(period::date_start)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            start,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts < self.end
    }
}

/// A contiguous slice of a dataset, processed as one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    pub granularity: Granularity,
    /// First day covered (inclusive).
    pub start: NaiveDate,
    /// First day not covered (exclusive).
    pub end: NaiveDate,
    pub estimated_rows: u64,
}

impl BatchDescriptor {
    /// Stable key, e.g. `2024-01-01..2024-02-01`. Lexicographic order of keys
    /// is chronological order of batches.
    pub fn key(&self) -> String {
        format!("{}..{}", self.start, self.end)
    }

    pub fn interval(&self) -> Interval {
        Interval::new(period::date_start(self.start), period::date_start(self.end))
    }
}

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "running" => Ok(BatchStatus::Running),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => bail!("unknown batch status: '{}'", other),
        }
    }
}

/// Durable progress of one batch of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    #[serde(flatten)]
    pub batch: BatchDescriptor,
    pub status: BatchStatus,
    /// Source records consumed so far, including skipped ones. This is the
    /// resume offset into the batch's stream.
    pub processed_rows: u64,
    pub total_rows: u64,
    /// Records dropped as data errors (missing key or required fields).
    #[serde(default)]
    pub skipped_rows: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Unix seconds of the last transition or checkpoint.
    pub updated_at: i64,
}

impl IngestionRecord {
    pub fn pending(batch: BatchDescriptor) -> Self {
        let total_rows = batch.estimated_rows;
        Self {
            batch,
            status: BatchStatus::Pending,
            processed_rows: 0,
            total_rows,
            skipped_rows: 0,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now().timestamp(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == BatchStatus::Completed
    }

    /// A failed batch that has used up its attempts and needs an operator.
    pub fn is_terminal_failure(&self, max_attempts: u32) -> bool {
        self.status == BatchStatus::Failed && self.attempts >= max_attempts
    }

    pub fn percent_complete(&self) -> f64 {
        if self.is_completed() {
            return 100.0;
        }
        if self.total_rows == 0 {
            return 0.0;
        }
        (self.processed_rows as f64 * 100.0 / self.total_rows as f64).min(100.0)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now().timestamp();
    }
}

/// Row count, distinct keys and date range of one side of a comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub rows: u64,
    pub distinct_keys: u64,
    pub first_ts: Option<DateTime<Utc>>,
    pub last_ts: Option<DateTime<Utc>>,
}
