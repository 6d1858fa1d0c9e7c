//! Ingest progress reporting and progress-store selection.
//!
//! Reports observable progress during `backfill ingest` so operators see
//! which batch is running, how far it got, and which batches failed.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use backfill_harness_core::events::{IngestProgressEvent, NoProgress, ProgressReporter};
use backfill_harness_core::monitor::format_number;
use backfill_harness_core::progress::ProgressStore;

use crate::config::{Config, ProgressBackend};
use crate::progress_file::FileProgressStore;
use crate::progress_sqlite::SqliteProgressStore;

/// Human-friendly progress on stderr:
/// "ingest tx  2024-02-05..2024-02-12  1,200 / 2,897 rows".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Planned {
                dataset,
                batches,
                estimated_rows,
            } => format!(
                "ingest {}  planned {} batches, ~{} rows\n",
                dataset,
                batches,
                format_number(*estimated_rows)
            ),
            IngestProgressEvent::BatchSkipped { dataset, batch } => {
                format!("ingest {}  {}  already completed\n", dataset, batch)
            }
            IngestProgressEvent::BatchStarted {
                dataset,
                batch,
                resume_from,
            } => {
                if *resume_from > 0 {
                    format!(
                        "ingest {}  {}  resuming at row {}\n",
                        dataset,
                        batch,
                        format_number(*resume_from)
                    )
                } else {
                    format!("ingest {}  {}  started\n", dataset, batch)
                }
            }
            IngestProgressEvent::ChunkWritten {
                dataset,
                batch,
                processed,
                total,
            } => format!(
                "ingest {}  {}  {} / {} rows\n",
                dataset,
                batch,
                format_number(*processed),
                format_number(*total)
            ),
            IngestProgressEvent::Retrying {
                dataset,
                batch,
                attempt,
                error,
            } => format!(
                "ingest {}  {}  retry {} after: {}\n",
                dataset, batch, attempt, error
            ),
            IngestProgressEvent::BatchCompleted {
                dataset,
                batch,
                rows,
            } => format!(
                "ingest {}  {}  completed ({} rows)\n",
                dataset,
                batch,
                format_number(*rows)
            ),
            IngestProgressEvent::BatchFailed {
                dataset,
                batch,
                error,
                attempts,
                terminal,
            } => format!(
                "ingest {}  {}  FAILED{} after {} attempt(s): {}\n",
                dataset,
                batch,
                if *terminal { " (terminal)" } else { "" },
                attempts,
                error
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Planned {
                dataset,
                batches,
                estimated_rows,
            } => serde_json::json!({
                "event": "planned",
                "dataset": dataset,
                "batches": batches,
                "estimated_rows": estimated_rows
            }),
            IngestProgressEvent::BatchSkipped { dataset, batch } => serde_json::json!({
                "event": "batch_skipped",
                "dataset": dataset,
                "batch": batch
            }),
            IngestProgressEvent::BatchStarted {
                dataset,
                batch,
                resume_from,
            } => serde_json::json!({
                "event": "batch_started",
                "dataset": dataset,
                "batch": batch,
                "resume_from": resume_from
            }),
            IngestProgressEvent::ChunkWritten {
                dataset,
                batch,
                processed,
                total,
            } => serde_json::json!({
                "event": "progress",
                "dataset": dataset,
                "batch": batch,
                "n": processed,
                "total": total
            }),
            IngestProgressEvent::Retrying {
                dataset,
                batch,
                attempt,
                error,
            } => serde_json::json!({
                "event": "retrying",
                "dataset": dataset,
                "batch": batch,
                "attempt": attempt,
                "error": error
            }),
            IngestProgressEvent::BatchCompleted {
                dataset,
                batch,
                rows,
            } => serde_json::json!({
                "event": "batch_completed",
                "dataset": dataset,
                "batch": batch,
                "rows": rows
            }),
            IngestProgressEvent::BatchFailed {
                dataset,
                batch,
                error,
                attempts,
                terminal,
            } => serde_json::json!({
                "event": "batch_failed",
                "dataset": dataset,
                "batch": batch,
                "error": error,
                "attempts": attempts,
                "terminal": terminal
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw {
            None => Ok(Self::default_for_tty()),
            Some("off") => Ok(ProgressMode::Off),
            Some("human") => Ok(ProgressMode::Human),
            Some("json") => Ok(ProgressMode::Json),
            Some(other) => anyhow::bail!(
                "Unknown progress mode: '{}'. Must be off, human, or json.",
                other
            ),
        }
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

/// Open the configured progress store. The SQLite backend shares the
/// target database pool.
pub fn open_store(config: &Config, pool: &SqlitePool) -> Arc<dyn ProgressStore> {
    match config.progress.backend {
        ProgressBackend::File => Arc::new(FileProgressStore::new(config.progress.path.clone())),
        ProgressBackend::Sqlite => Arc::new(SqliteProgressStore::new(pool.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_mode_parsing() {
        assert_eq!(ProgressMode::parse(Some("json")).unwrap(), ProgressMode::Json);
        assert_eq!(ProgressMode::parse(Some("off")).unwrap(), ProgressMode::Off);
        assert!(ProgressMode::parse(Some("loud")).is_err());
    }
}
