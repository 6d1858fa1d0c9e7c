//! Target store abstraction.
//!
//! The [`Sink`] trait is the relational target the engine writes into and
//! the verifier and deduplicator read from. Writes are always
//! upsert-or-ignore keyed by natural key: an existing row with the same key
//! is kept unless the incoming record is newer, in which case it is merged.
//! A blind insert is never issued.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert_or_ignore`](Sink::upsert_or_ignore) | Write one row |
//! | [`write_chunk`](Sink::write_chunk) | Write a sub-chunk, atomically where supported |
//! | [`count`](Sink::count) | Count rows matching a filter |
//! | [`stats`](Sink::stats) | Rows, distinct keys, date range |
//! | [`remove_duplicates`](Sink::remove_duplicates) | Set-based duplicate removal |
//! | [`execute_ddl`](Sink::execute_ddl) | Install constraints |

pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;

use crate::models::{DatasetStats, Interval, TargetRow};

/// Why a sink operation failed. Duplicate keys are not errors; they are
/// reported as [`WriteOutcome::DuplicateIgnored`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Connection drop, timeout, lock contention. Worth retrying.
    #[error("transient sink error: {0}")]
    Transient(String),
    /// The sink refused the write for a reason other than a duplicate key
    /// (schema mismatch, constraint other than uniqueness).
    #[error("sink rejected write: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Result of one upsert-or-ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No row with this key existed.
    Inserted,
    /// A row existed with an older timestamp and was overwritten.
    Merged,
    /// A row with this key and a same-or-newer timestamp already existed.
    DuplicateIgnored,
}

/// Tally of outcomes for a sub-chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub inserted: u64,
    pub merged: u64,
    pub ignored: u64,
}

impl ChunkOutcome {
    pub fn record(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted => self.inserted += 1,
            WriteOutcome::Merged => self.merged += 1,
            WriteOutcome::DuplicateIgnored => self.ignored += 1,
        }
    }

    pub fn add(&mut self, other: ChunkOutcome) {
        self.inserted += other.inserted;
        self.merged += other.merged;
        self.ignored += other.ignored;
    }
}

/// Row predicate for [`Sink::count`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub dataset: String,
    pub interval: Option<Interval>,
}

impl RowFilter {
    pub fn dataset(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            interval: None,
        }
    }

    pub fn within(mut self, interval: Interval) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// Validated list of natural-key column names, safe to splice into SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumns(Vec<String>);

impl KeyColumns {
    pub fn new<S: AsRef<str>>(columns: &[S]) -> Result<Self> {
        if columns.is_empty() {
            bail!("natural key needs at least one column");
        }
        let mut out = Vec::with_capacity(columns.len());
        for col in columns {
            let col = col.as_ref();
            if !is_identifier(col) {
                bail!("invalid key column name: '{}'", col);
            }
            out.push(col.to_string());
        }
        Ok(Self(out))
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    /// `a, b, c`
    pub fn joined(&self) -> String {
        self.0.join(", ")
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Name of the table rows land in (used when generating DDL).
    fn table(&self) -> &str;

    async fn upsert_or_ignore(&self, dataset: &str, row: &TargetRow)
        -> Result<WriteOutcome, SinkError>;

    /// Write a sub-chunk. Backends with transactions override this so the
    /// chunk is all-or-nothing.
    async fn write_chunk(&self, dataset: &str, rows: &[TargetRow]) -> Result<ChunkOutcome, SinkError> {
        let mut outcome = ChunkOutcome::default();
        for row in rows {
            outcome.record(self.upsert_or_ignore(dataset, row).await?);
        }
        Ok(outcome)
    }

    async fn count(&self, filter: &RowFilter) -> Result<u64, SinkError>;

    async fn stats(&self, dataset: &str) -> Result<DatasetStats, SinkError>;

    /// Among rows sharing `key`, keep the one with the latest timestamp
    /// (ties: latest inserted) and delete the rest in one statement.
    async fn remove_duplicates(&self, key: &KeyColumns) -> Result<u64, SinkError>;

    async fn execute_ddl(&self, statement: &str) -> Result<(), SinkError>;
}
