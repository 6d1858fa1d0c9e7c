//! Ingestion progress events.
//!
//! The engine reports what it is doing through a [`ProgressReporter`];
//! the CLI turns events into human or JSON lines on stderr.

/// A single progress event emitted by the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum IngestProgressEvent {
    /// The plan for a dataset is known.
    Planned {
        dataset: String,
        batches: usize,
        estimated_rows: u64,
    },
    /// A batch was already completed by an earlier run.
    BatchSkipped { dataset: String, batch: String },
    /// A batch transitioned to running. `resume_from` is the record offset.
    BatchStarted {
        dataset: String,
        batch: String,
        resume_from: u64,
    },
    /// A sub-chunk was written and checkpointed.
    ChunkWritten {
        dataset: String,
        batch: String,
        processed: u64,
        total: u64,
    },
    /// A transient error is being retried after a delay.
    Retrying {
        dataset: String,
        batch: String,
        attempt: u32,
        error: String,
    },
    BatchCompleted {
        dataset: String,
        batch: String,
        rows: u64,
    },
    BatchFailed {
        dataset: String,
        batch: String,
        error: String,
        attempts: u32,
        terminal: bool,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}
