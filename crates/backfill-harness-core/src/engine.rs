//! Resumable batch ingestion.
//!
//! The [`Engine`] walks a dataset's plan in order. Each batch moves through
//! `Pending → Running → Completed`, or `Running → Failed` on error; failed
//! batches are retried on the next invocation until `max_attempts` is
//! reached, after which they are terminal and need an operator.
//!
//! Within a batch, records are written in sub-chunks of `chunk_size`. After
//! each chunk is committed, `processed_rows` is checkpointed; a crash loses
//! at most one chunk of progress, and because writes are upsert-or-ignore
//! by natural key, replaying that chunk cannot create duplicates.
//!
//! Cancellation is observed only between chunks, so a cancelled batch is
//! left `Running` with an exact checkpoint and resumes on the next run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use futures::StreamExt;

use crate::distribution;
use crate::events::{IngestProgressEvent, NoProgress, ProgressReporter};
use crate::models::{BatchDescriptor, BatchStatus, IngestionRecord, TargetRow};
use crate::planner::{self, BatchBudget};
use crate::progress::{self, ProgressStore};
use crate::retry::{Backoff, NoSleep, Sleeper};
use crate::sink::{ChunkOutcome, Sink, SinkError};
use crate::source::Source;
use crate::transform::RecordTransform;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Records per sub-chunk (write transaction and checkpoint interval).
    pub chunk_size: usize,
    /// Failed attempts allowed per batch before it becomes terminal. Also
    /// caps the writes tried for one sub-chunk on transient errors.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// A batch that ended this run in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub batch: String,
    pub error: String,
    pub attempts: u32,
    /// Attempts are exhausted; the batch will not be retried automatically.
    pub terminal: bool,
}

/// Outcome of one [`Engine::run`] over a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetRunReport {
    pub dataset: String,
    pub batches_total: usize,
    pub batches_completed: usize,
    pub batches_skipped: usize,
    pub rows_processed: u64,
    pub rows_skipped: u64,
    pub writes: ChunkOutcome,
    pub failure: Option<BatchFailure>,
    pub cancelled: bool,
}

impl DatasetRunReport {
    fn new(dataset: &str, batches_total: usize) -> Self {
        Self {
            dataset: dataset.to_string(),
            batches_total,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && !self.cancelled
    }

    /// Every batch of the plan is completed (this run or earlier).
    pub fn is_complete(&self) -> bool {
        self.is_success() && self.batches_completed + self.batches_skipped == self.batches_total
    }
}

enum BatchEnd {
    Completed,
    Cancelled,
    Failed(BatchFailure),
}

pub struct Engine {
    config: EngineConfig,
    progress: Arc<dyn ProgressStore>,
    sleeper: Arc<dyn Sleeper>,
    reporter: Arc<dyn ProgressReporter>,
    cancel: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(config: EngineConfig, progress: Arc<dyn ProgressStore>) -> Self {
        Self {
            config,
            progress,
            sleeper: Arc::new(NoSleep),
            reporter: Arc::new(NoProgress),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Share a stop flag; setting it stops the run at the next chunk boundary.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Reuse the plan frozen by an earlier run, or analyze the source,
    /// plan it, and register `Pending` records for every batch.
    pub async fn plan_or_resume(
        &self,
        dataset: &str,
        source: &dyn Source,
        budget: BatchBudget,
        floor: Option<NaiveDate>,
    ) -> Result<Vec<BatchDescriptor>> {
        if let Some(plan) = progress::frozen_plan(self.progress.as_ref(), dataset).await? {
            tracing::info!(dataset, batches = plan.len(), "resuming frozen plan");
            return Ok(plan);
        }

        let profile = distribution::analyze(source, floor).await?;
        if profile.excluded > 0 {
            tracing::warn!(
                dataset,
                excluded = profile.excluded,
                "rows without a parseable timestamp excluded from the plan"
            );
        }
        let plan = planner::plan_batches(&profile, budget);
        progress::register_plan(self.progress.as_ref(), dataset, &plan)
            .await
            .with_context(|| format!("failed to register plan for dataset '{}'", dataset))?;
        tracing::info!(
            dataset,
            batches = plan.len(),
            rows = profile.counted,
            "plan registered"
        );
        Ok(plan)
    }

    /// Ingest every batch of `plan` that is not yet completed.
    ///
    /// Returns `Err` only when the progress store itself fails; batch-level
    /// failures are recorded in the store and surfaced in the report.
    pub async fn run(
        &self,
        dataset: &str,
        plan: &[BatchDescriptor],
        source: &dyn Source,
        sink: &dyn Sink,
        transform: &RecordTransform,
    ) -> Result<DatasetRunReport> {
        let mut report = DatasetRunReport::new(dataset, plan.len());
        self.reporter.report(IngestProgressEvent::Planned {
            dataset: dataset.to_string(),
            batches: plan.len(),
            estimated_rows: plan.iter().map(|b| b.estimated_rows).sum(),
        });

        if plan.is_empty() {
            tracing::info!(dataset, "no rows on or after the date floor; nothing to ingest");
            return Ok(report);
        }

        for batch in plan {
            if self.cancelled() {
                report.cancelled = true;
                break;
            }

            let key = batch.key();
            let mut record = self
                .progress
                .get(dataset, &key)
                .await
                .with_context(|| format!("failed to read progress for {}/{}", dataset, key))?
                .unwrap_or_else(|| IngestionRecord::pending(batch.clone()));

            if record.is_completed() {
                report.batches_skipped += 1;
                self.reporter.report(IngestProgressEvent::BatchSkipped {
                    dataset: dataset.to_string(),
                    batch: key,
                });
                continue;
            }

            if record.is_terminal_failure(self.config.max_attempts) {
                let failure = BatchFailure {
                    batch: key.clone(),
                    error: record.last_error.clone().unwrap_or_default(),
                    attempts: record.attempts,
                    terminal: true,
                };
                tracing::error!(
                    dataset,
                    batch = %key,
                    attempts = record.attempts,
                    "batch exhausted its attempts; operator reset required"
                );
                self.report_failure(dataset, &failure);
                report.failure = Some(failure);
                break;
            }

            match self
                .run_batch(dataset, &key, &mut record, source, sink, transform, &mut report)
                .await?
            {
                BatchEnd::Completed => report.batches_completed += 1,
                BatchEnd::Cancelled => {
                    report.cancelled = true;
                    break;
                }
                BatchEnd::Failed(failure) => {
                    self.report_failure(dataset, &failure);
                    report.failure = Some(failure);
                    break;
                }
            }
        }

        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_batch(
        &self,
        dataset: &str,
        key: &str,
        record: &mut IngestionRecord,
        source: &dyn Source,
        sink: &dyn Sink,
        transform: &RecordTransform,
        report: &mut DatasetRunReport,
    ) -> Result<BatchEnd> {
        let resume_from = record.processed_rows;
        record.status = BatchStatus::Running;
        record.touch();
        self.persist(dataset, key, record).await?;

        tracing::info!(dataset, batch = %key, resume_from, "batch started");
        self.reporter.report(IngestProgressEvent::BatchStarted {
            dataset: dataset.to_string(),
            batch: key.to_string(),
            resume_from,
        });

        let mut stream = match source.stream(record.batch.interval()).await {
            Ok(stream) => stream,
            Err(e) => {
                return self
                    .fail(dataset, key, record, format!("source read failed: {:#}", e))
                    .await
            }
        };

        let chunk_size = self.config.chunk_size.max(1);
        let mut position = 0u64;
        let mut chunk: Vec<TargetRow> = Vec::with_capacity(chunk_size);
        let mut consumed = 0u64;
        let mut skipped = 0u64;

        while let Some(item) = stream.next().await {
            let source_record = match item {
                Ok(r) => r,
                Err(e) => {
                    return self
                        .fail(dataset, key, record, format!("source read failed: {:#}", e))
                        .await
                }
            };

            position += 1;
            if position <= resume_from {
                continue;
            }

            consumed += 1;
            match transform.apply(&source_record) {
                Ok(row) => chunk.push(row),
                Err(e) => {
                    skipped += 1;
                    tracing::debug!(dataset, batch = %key, error = %e, "record skipped");
                }
            }

            if consumed as usize == chunk_size {
                if let Some(end) = self
                    .flush(dataset, key, record, sink, &chunk, consumed, skipped, report)
                    .await?
                {
                    return Ok(end);
                }
                chunk.clear();
                consumed = 0;
                skipped = 0;
                if self.cancelled() {
                    tracing::warn!(dataset, batch = %key, processed = record.processed_rows, "cancelled at chunk boundary");
                    return Ok(BatchEnd::Cancelled);
                }
            }
        }

        if consumed > 0 {
            if let Some(end) = self
                .flush(dataset, key, record, sink, &chunk, consumed, skipped, report)
                .await?
            {
                return Ok(end);
            }
        }

        record.status = BatchStatus::Completed;
        record.total_rows = record.processed_rows;
        record.last_error = None;
        record.touch();
        self.persist(dataset, key, record).await?;

        tracing::info!(dataset, batch = %key, rows = record.processed_rows, "batch completed");
        self.reporter.report(IngestProgressEvent::BatchCompleted {
            dataset: dataset.to_string(),
            batch: key.to_string(),
            rows: record.processed_rows,
        });
        Ok(BatchEnd::Completed)
    }

    /// Write one sub-chunk with transient-error retries, then checkpoint.
    /// Returns `Some` when the batch has to end here.
    ///
    /// Retries are counted per chunk. `record.attempts` only moves when the
    /// retries run out and the batch fails.
    #[allow(clippy::too_many_arguments)]
    async fn flush(
        &self,
        dataset: &str,
        key: &str,
        record: &mut IngestionRecord,
        sink: &dyn Sink,
        rows: &[TargetRow],
        consumed: u64,
        skipped: u64,
        report: &mut DatasetRunReport,
    ) -> Result<Option<BatchEnd>> {
        let mut retries = 0u32;
        loop {
            match sink.write_chunk(dataset, rows).await {
                Ok(outcome) => {
                    record.processed_rows += consumed;
                    record.skipped_rows += skipped;
                    record.total_rows = record.total_rows.max(record.processed_rows);
                    record.touch();
                    self.persist(dataset, key, record).await?;

                    report.rows_processed += consumed;
                    report.rows_skipped += skipped;
                    report.writes.add(outcome);
                    self.reporter.report(IngestProgressEvent::ChunkWritten {
                        dataset: dataset.to_string(),
                        batch: key.to_string(),
                        processed: record.processed_rows,
                        total: record.total_rows,
                    });
                    return Ok(None);
                }
                Err(SinkError::Transient(msg)) => {
                    retries += 1;
                    if retries >= self.config.max_attempts {
                        let error = format!(
                            "transient sink error after {} tries: {}",
                            retries, msg
                        );
                        return self.fail(dataset, key, record, error).await.map(Some);
                    }

                    let delay = self.config.backoff.delay(retries);
                    tracing::warn!(
                        dataset,
                        batch = %key,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "transient sink error; retrying chunk"
                    );
                    self.reporter.report(IngestProgressEvent::Retrying {
                        dataset: dataset.to_string(),
                        batch: key.to_string(),
                        attempt: retries,
                        error: msg,
                    });
                    self.sleeper.sleep(delay).await;
                }
                Err(err @ SinkError::Rejected(_)) => {
                    return self.fail(dataset, key, record, err.to_string()).await.map(Some);
                }
            }
        }
    }

    /// Count a failed attempt and mark the batch `Failed`.
    async fn fail(
        &self,
        dataset: &str,
        key: &str,
        record: &mut IngestionRecord,
        error: String,
    ) -> Result<BatchEnd> {
        record.attempts += 1;
        self.finish_failed(dataset, key, record, error).await
    }

    async fn finish_failed(
        &self,
        dataset: &str,
        key: &str,
        record: &mut IngestionRecord,
        error: String,
    ) -> Result<BatchEnd> {
        record.status = BatchStatus::Failed;
        record.last_error = Some(error.clone());
        record.touch();
        self.persist(dataset, key, record).await?;

        let terminal = record.is_terminal_failure(self.config.max_attempts);
        tracing::error!(
            dataset,
            batch = %key,
            attempts = record.attempts,
            terminal,
            error = %error,
            "batch failed"
        );
        Ok(BatchEnd::Failed(BatchFailure {
            batch: key.to_string(),
            error,
            attempts: record.attempts,
            terminal,
        }))
    }

    async fn persist(&self, dataset: &str, key: &str, record: &IngestionRecord) -> Result<()> {
        self.progress
            .put(dataset, key, record)
            .await
            .with_context(|| format!("failed to persist progress for {}/{}", dataset, key))
    }

    fn report_failure(&self, dataset: &str, failure: &BatchFailure) {
        self.reporter.report(IngestProgressEvent::BatchFailed {
            dataset: dataset.to_string(),
            batch: failure.batch.clone(),
            error: failure.error.clone(),
            attempts: failure.attempts,
            terminal: failure.terminal,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::IngestProgressEvent as Ev;
    use crate::progress::memory::InMemoryProgressStore;
    use crate::retry::RecordingSleeper;
    use crate::sink::memory::InMemorySink;
    use crate::models::DatasetStats;
    use crate::sink::{KeyColumns, RowFilter, WriteOutcome};
    use crate::source::MemorySource;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::{json, Map, Value};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    fn fields(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    /// `per_month` rows in each of Jan..=months of 2024, keyed `m-i`.
    fn source(months: u32, per_month: u64) -> MemorySource {
        let mut src = MemorySource::new();
        for m in 1..=months {
            let base = Utc.with_ymd_and_hms(2024, m, 1, 0, 0, 0).unwrap();
            for i in 0..per_month {
                let ts = base + Duration::minutes(i as i64);
                src.push(Some(ts), fields(json!({"id": format!("{}-{}", m, i), "n": i})));
            }
        }
        src
    }

    fn transform() -> RecordTransform {
        RecordTransform::new(vec!["id".into()], vec![]).unwrap()
    }

    fn config(chunk_size: usize) -> EngineConfig {
        EngineConfig {
            chunk_size,
            max_attempts: 3,
            backoff: Backoff::new(StdDuration::from_millis(10), StdDuration::from_millis(100)),
        }
    }

    async fn planned(engine: &Engine, src: &MemorySource) -> Vec<BatchDescriptor> {
        engine
            .plan_or_resume("tx", src, BatchBudget::new(100, 1_000).unwrap(), None)
            .await
            .unwrap()
    }

    /// Captures events; optionally raises a cancel flag once a batch has
    /// checkpointed at least `after` rows.
    #[derive(Default)]
    struct Capture {
        events: Mutex<Vec<Ev>>,
        cancel_at: Option<(String, u64, Arc<AtomicBool>)>,
    }

    impl ProgressReporter for Capture {
        fn report(&self, event: Ev) {
            if let (Some((batch, after, flag)), Ev::ChunkWritten { batch: b, processed, .. }) =
                (&self.cancel_at, &event)
            {
                if b == batch && processed >= after {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn ingests_all_batches_and_completes() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = Engine::new(config(100), progress.clone());
        let src = source(3, 500);
        let sink = InMemorySink::new();

        let plan = planned(&engine, &src).await;
        assert_eq!(plan.len(), 3);
        let report = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.batches_completed, 3);
        assert_eq!(report.rows_processed, 1_500);
        assert_eq!(report.writes.inserted, 1_500);
        assert_eq!(sink.count(&RowFilter::dataset("tx")).await.unwrap(), 1_500);
        assert!(progress.list_incomplete("tx").await.unwrap().is_empty());
        for (_, rec) in progress.list("tx").await.unwrap() {
            assert_eq!(rec.status, BatchStatus::Completed);
            assert_eq!(rec.processed_rows, 500);
            assert_eq!(rec.total_rows, 500);
        }
    }

    #[tokio::test]
    async fn rerun_is_a_noop() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = Engine::new(config(100), progress.clone());
        let src = source(2, 300);
        let sink = InMemorySink::new();
        let plan = planned(&engine, &src).await;

        engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        let again = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();

        assert_eq!(again.batches_skipped, 2);
        assert_eq!(again.batches_completed, 0);
        assert_eq!(again.rows_processed, 0);
        assert!(again.is_complete());
        assert_eq!(sink.count(&RowFilter::dataset("tx")).await.unwrap(), 600);
    }

    #[tokio::test]
    async fn cancel_leaves_batch_running_and_resume_finishes_it() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let src = source(3, 500);
        let sink = InMemorySink::new();
        let flag = Arc::new(AtomicBool::new(false));

        let plan = planned(&Engine::new(config(100), progress.clone()), &src).await;
        let capture = Arc::new(Capture {
            cancel_at: Some((plan[1].key(), 200, flag.clone())),
            ..Capture::default()
        });
        let engine = Engine::new(config(100), progress.clone())
            .with_cancel(flag.clone())
            .with_reporter(capture.clone());

        let first = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        assert!(first.cancelled);
        assert!(!first.is_success());
        let mid = progress.get("tx", &plan[1].key()).await.unwrap().unwrap();
        assert_eq!(mid.status, BatchStatus::Running);
        assert_eq!(mid.processed_rows, 200);
        assert_eq!(sink.count(&RowFilter::dataset("tx")).await.unwrap(), 700);

        let capture = Arc::new(Capture::default());
        let engine = Engine::new(config(100), progress.clone()).with_reporter(capture.clone());
        let second = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();

        assert!(second.is_complete());
        assert_eq!(second.batches_skipped, 1);
        assert_eq!(second.rows_processed, 300 + 500);
        let events = capture.events.lock().unwrap();
        assert!(events.contains(&Ev::BatchStarted {
            dataset: "tx".into(),
            batch: plan[1].key(),
            resume_from: 200,
        }));
        let stats = sink.stats("tx").await.unwrap();
        assert_eq!(stats.rows, 1_500);
        assert_eq!(stats.distinct_keys, 1_500);
    }

    #[tokio::test]
    async fn lagging_checkpoint_replays_without_duplicates() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = Engine::new(config(100), progress.clone());
        let src = source(1, 500);
        let sink = InMemorySink::new();
        let plan = planned(&engine, &src).await;
        let key = plan[0].key();

        // Rows 0..300 reached the sink but the checkpoint only says 100,
        // as after a crash between commit and checkpoint.
        let t = transform();
        let mut stream = src.stream(plan[0].interval()).await.unwrap();
        let mut written = Vec::new();
        while let Some(r) = stream.next().await {
            if written.len() == 300 {
                break;
            }
            written.push(t.apply(&r.unwrap()).unwrap());
        }
        sink.write_chunk("tx", &written).await.unwrap();
        let mut rec = progress.get("tx", &key).await.unwrap().unwrap();
        rec.status = BatchStatus::Running;
        rec.processed_rows = 100;
        progress.put("tx", &key, &rec).await.unwrap();

        let report = engine.run("tx", &plan, &src, &sink, &t).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.rows_processed, 400);
        assert_eq!(report.writes.ignored, 200);
        assert_eq!(report.writes.inserted, 200);
        let stats = sink.stats("tx").await.unwrap();
        assert_eq!(stats.rows, 500);
        assert_eq!(stats.distinct_keys, 500);
    }

    #[tokio::test]
    async fn transient_errors_retry_with_backoff() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let sleeper = Arc::new(RecordingSleeper::new());
        let engine = Engine::new(config(100), progress.clone()).with_sleeper(sleeper.clone());
        let src = source(1, 250);
        let sink = InMemorySink::new();
        sink.inject_faults([
            SinkError::Transient("connection reset".into()),
            SinkError::Transient("timeout".into()),
        ]);
        let plan = planned(&engine, &src).await;

        let report = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(sink.count(&RowFilter::dataset("tx")).await.unwrap(), 250);
        assert_eq!(
            sleeper.calls(),
            vec![StdDuration::from_millis(10), StdDuration::from_millis(20)]
        );
        let rec = progress.get("tx", &plan[0].key()).await.unwrap().unwrap();
        assert_eq!(rec.attempts, 0);
        assert!(rec.last_error.is_none());
    }

    /// Fails every other `write_chunk` call with a transient error.
    struct EveryOtherWrite {
        inner: InMemorySink,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Sink for EveryOtherWrite {
        fn table(&self) -> &str {
            self.inner.table()
        }
        async fn upsert_or_ignore(&self, d: &str, row: &TargetRow) -> Result<WriteOutcome, SinkError> {
            self.inner.upsert_or_ignore(d, row).await
        }
        async fn write_chunk(&self, d: &str, rows: &[TargetRow]) -> Result<ChunkOutcome, SinkError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return Err(SinkError::Transient("connection reset".into()));
            }
            self.inner.write_chunk(d, rows).await
        }
        async fn count(&self, filter: &RowFilter) -> Result<u64, SinkError> {
            self.inner.count(filter).await
        }
        async fn stats(&self, d: &str) -> Result<DatasetStats, SinkError> {
            self.inner.stats(d).await
        }
        async fn remove_duplicates(&self, key: &KeyColumns) -> Result<u64, SinkError> {
            self.inner.remove_duplicates(key).await
        }
        async fn execute_ddl(&self, statement: &str) -> Result<(), SinkError> {
            self.inner.execute_ddl(statement).await
        }
    }

    #[tokio::test]
    async fn recovered_blips_in_every_chunk_do_not_fail_the_batch() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let sleeper = Arc::new(RecordingSleeper::new());
        let engine = Engine::new(config(100), progress.clone()).with_sleeper(sleeper.clone());
        let src = source(1, 500);
        let sink = EveryOtherWrite {
            inner: InMemorySink::new(),
            calls: AtomicUsize::new(0),
        };
        let plan = planned(&engine, &src).await;

        let report = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        assert!(report.is_complete(), "{:?}", report.failure);
        assert_eq!(report.rows_processed, 500);
        assert_eq!(sink.inner.count(&RowFilter::dataset("tx")).await.unwrap(), 500);
        // Each of the five chunks backs off once, from the first step.
        assert_eq!(sleeper.calls(), vec![StdDuration::from_millis(10); 5]);
        let rec = progress.get("tx", &plan[0].key()).await.unwrap().unwrap();
        assert_eq!(rec.status, BatchStatus::Completed);
        assert_eq!(rec.attempts, 0);
    }

    #[tokio::test]
    async fn exhausted_transient_retries_fail_the_batch_once_per_run() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = Engine::new(config(100), progress.clone());
        let src = source(2, 150);
        let sink = InMemorySink::new();
        // Three runs, each exhausting the three tries of the first chunk.
        sink.inject_faults((0..9).map(|_| SinkError::Transient("down".into())));
        let plan = planned(&engine, &src).await;

        let first = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        let failure = first.failure.unwrap();
        assert!(!failure.terminal);
        assert_eq!(failure.batch, plan[0].key());
        assert_eq!(failure.attempts, 1);
        assert!(failure.error.contains("down"));
        // Later batches are not touched.
        let later = progress.get("tx", &plan[1].key()).await.unwrap().unwrap();
        assert_eq!(later.status, BatchStatus::Pending);

        engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        let third = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        let failure = third.failure.unwrap();
        assert!(failure.terminal);
        assert_eq!(failure.attempts, 3);

        // Never silently skipped, and not retried: the sink would accept
        // writes now, yet nothing reaches it.
        let again = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        assert!(again.failure.unwrap().terminal);
        assert_eq!(sink.count(&RowFilter::dataset("tx")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_write_after_recovered_blips_is_retryable() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = Engine::new(config(100), progress.clone());
        let src = source(1, 300);
        let sink = InMemorySink::new();
        sink.inject_faults([
            SinkError::Transient("timeout".into()),
            SinkError::Transient("timeout".into()),
        ]);
        let plan = planned(&engine, &src).await;
        let stop = Arc::new(AtomicBool::new(false));
        let capture = Arc::new(Capture {
            cancel_at: Some((plan[0].key(), 100, stop.clone())),
            ..Capture::default()
        });
        let first = Engine::new(config(100), progress.clone())
            .with_cancel(stop)
            .with_reporter(capture);
        assert!(first.run("tx", &plan, &src, &sink, &transform()).await.unwrap().cancelled);

        sink.inject_faults([SinkError::Rejected("constraint failed".into())]);
        let second = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        let failure = second.failure.unwrap();
        assert_eq!(failure.attempts, 1);
        assert!(!failure.terminal);

        let third = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        assert!(third.is_complete());
        assert_eq!(sink.count(&RowFilter::dataset("tx")).await.unwrap(), 300);
    }

    #[tokio::test]
    async fn floor_inside_a_month_keeps_earlier_rows_out() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = Engine::new(config(5), progress);
        let mut src = MemorySource::new();
        for d in 1..=28 {
            let ts = Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap();
            src.push(Some(ts), fields(json!({"id": format!("d{}", d)})));
        }
        let floor = NaiveDate::from_ymd_opt(2024, 1, 15);
        let plan = engine
            .plan_or_resume("tx", &src, BatchBudget::new(1, 100).unwrap(), floor)
            .await
            .unwrap();
        assert_eq!(plan[0].estimated_rows, 14);

        let sink = InMemorySink::new();
        let report = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.rows_processed, 14);

        let verification = crate::verify::verify("tx", &src, &sink, &transform(), floor)
            .await
            .unwrap();
        assert_eq!(verification.expected_rows, 14);
        assert_eq!(verification.actual_rows, 14);
        assert!(verification.consistent, "{:?}", verification.issues);
    }

    #[tokio::test]
    async fn rejected_write_fails_then_retries_next_run() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = Engine::new(config(100), progress.clone());
        let src = source(2, 150);
        let sink = InMemorySink::new();
        sink.inject_faults([SinkError::Rejected("no such column: payload".into())]);
        let plan = planned(&engine, &src).await;

        let first = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        let failure = first.failure.unwrap();
        assert!(!failure.terminal);
        assert_eq!(failure.attempts, 1);
        assert!(failure.error.contains("no such column"));
        let rec = progress.get("tx", &plan[0].key()).await.unwrap().unwrap();
        assert_eq!(rec.status, BatchStatus::Failed);
        assert_eq!(rec.last_error.as_deref(), Some(failure.error.as_str()));

        let second = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        assert!(second.is_complete());
        assert_eq!(sink.count(&RowFilter::dataset("tx")).await.unwrap(), 300);
    }

    #[tokio::test]
    async fn data_errors_are_skipped_and_counted() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = Engine::new(config(10), progress.clone());
        let mut src = MemorySource::new();
        let ts = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        src.push(Some(ts), fields(json!({"id": "a"})));
        src.push(Some(ts), fields(json!({"other": "no key"})));
        src.push(Some(ts), fields(json!({"id": "b"})));
        let plan = engine
            .plan_or_resume("tx", &src, BatchBudget::new(1, 10).unwrap(), None)
            .await
            .unwrap();

        let sink = InMemorySink::new();
        let report = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.rows_processed, 3);
        assert_eq!(report.rows_skipped, 1);
        let rec = progress.get("tx", &plan[0].key()).await.unwrap().unwrap();
        assert_eq!(rec.skipped_rows, 1);
        assert_eq!(sink.count(&RowFilter::dataset("tx")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_plan_is_trivially_complete() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = Engine::new(config(10), progress);
        let src = MemorySource::new();
        let plan = planned(&engine, &src).await;
        assert!(plan.is_empty());
        let report = engine
            .run("tx", &plan, &src, &InMemorySink::new(), &transform())
            .await
            .unwrap();
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn plan_is_frozen_across_runs() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = Engine::new(config(10), progress);
        let first = planned(&engine, &source(2, 300)).await;
        // A denser source would plan differently, but the registered plan wins.
        let second = planned(&engine, &source(2, 3_000)).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn later_duplicate_in_source_wins() {
        let progress = Arc::new(InMemoryProgressStore::new());
        let engine = Engine::new(config(10), progress);
        let mut src = MemorySource::new();
        src.push(
            Some(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()),
            fields(json!({"id": "dup", "v": "january"})),
        );
        src.push(
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()),
            fields(json!({"id": "dup", "v": "march"})),
        );
        let plan = engine
            .plan_or_resume("tx", &src, BatchBudget::new(1, 10).unwrap(), None)
            .await
            .unwrap();
        let sink = InMemorySink::new();
        let report = engine.run("tx", &plan, &src, &sink, &transform()).await.unwrap();

        assert_eq!(report.writes.inserted, 1);
        assert_eq!(report.writes.merged, 1);
        let rows = sink.rows();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].row.payload_json.contains("march"));
    }
}
