//! Ingestion orchestration.
//!
//! Wires config, sources, the SQLite sink and the progress store into an
//! [`Engine`] and runs it for one dataset or all of them. With `--parallel`
//! each dataset runs as an independent engine future; otherwise datasets run
//! one after another in name order. Ctrl-C sets a shared stop flag that the
//! engine observes between chunks, so an interrupted run resumes exactly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};

use backfill_harness_core::engine::{DatasetRunReport, Engine};
use backfill_harness_core::models::BatchStatus;
use backfill_harness_core::progress::ProgressStore;
use backfill_harness_core::sink::Sink;

use crate::clock::TokioSleeper;
use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::progress::{self, ProgressMode};
use crate::sink_sqlite::SqliteSink;
use crate::sources::{build_source, build_transform};

/// Install a Ctrl-C handler that flips the returned flag.
pub fn interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current chunk");
            handle.store(true, Ordering::SeqCst);
        }
    });
    flag
}

/// Plan (or resume) and ingest a single dataset.
pub async fn ingest_dataset(
    config: &Config,
    engine: &Engine,
    sink: &dyn Sink,
    name: &str,
) -> Result<DatasetRunReport> {
    let dataset = config.dataset(name)?;
    let source = build_source(dataset);
    let transform = build_transform(dataset)?;
    let floor = config.date_floor(name)?;
    let budget = config.ingest.budget()?;

    let plan = engine
        .plan_or_resume(name, source.as_ref(), budget, floor)
        .await?;
    engine
        .run(name, &plan, source.as_ref(), sink, &transform)
        .await
}

pub async fn run_ingest(
    config: &Config,
    env_url: Option<&str>,
    selector: &str,
    parallel: bool,
    mode: ProgressMode,
) -> Result<()> {
    let names = config.select_datasets(selector)?;
    let pool = db::connect(config, env_url).await?;
    migrate::migrate(&pool).await?;

    let store = progress::open_store(config, &pool);
    let sink = SqliteSink::new(pool.clone());
    let cancel = interrupt_flag();
    let engine = Engine::new(config.ingest.engine_config(), store)
        .with_sleeper(Arc::new(TokioSleeper))
        .with_reporter(mode.reporter())
        .with_cancel(cancel.clone());

    let results: Vec<(String, Result<DatasetRunReport>)> = if parallel {
        let runs = names
            .iter()
            .map(|name| ingest_dataset(config, &engine, &sink, name));
        let outcomes = futures::future::join_all(runs).await;
        names.into_iter().zip(outcomes).collect()
    } else {
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let outcome = ingest_dataset(config, &engine, &sink, &name).await;
            results.push((name, outcome));
        }
        results
    };

    pool.close().await;
    print_summary(&results);

    let failed = results
        .iter()
        .filter(|(_, r)| !matches!(r, Ok(report) if report.is_success()))
        .count();
    if cancel.load(Ordering::SeqCst) {
        bail!("ingest interrupted; run the same command again to resume");
    }
    if failed > 0 {
        bail!("ingest finished with {} failed dataset(s)", failed);
    }
    Ok(())
}

fn print_summary(results: &[(String, Result<DatasetRunReport>)]) {
    println!(
        "{:<20} {:>9} {:>10} {:>10} {:>9} {:>9} {:>9}  STATUS",
        "DATASET", "BATCHES", "ROWS", "SKIPPED", "INSERTED", "MERGED", "IGNORED"
    );
    for (name, result) in results {
        match result {
            Ok(report) => {
                let status = if let Some(failure) = &report.failure {
                    format!(
                        "failed {}{}: {}",
                        failure.batch,
                        if failure.terminal { " (terminal)" } else { "" },
                        failure.error
                    )
                } else if report.cancelled {
                    "interrupted".to_string()
                } else {
                    "ok".to_string()
                };
                println!(
                    "{:<20} {:>9} {:>10} {:>10} {:>9} {:>9} {:>9}  {}",
                    name,
                    format!(
                        "{}/{}",
                        report.batches_completed + report.batches_skipped,
                        report.batches_total
                    ),
                    report.rows_processed,
                    report.rows_skipped,
                    report.writes.inserted,
                    report.writes.merged,
                    report.writes.ignored,
                    status
                );
            }
            Err(e) => println!("{:<20} error: {:#}", name, e),
        }
    }
}

/// Operator reset of a dataset's progress.
///
/// With `failed_only`, `Failed` records are re-armed (attempts cleared,
/// checkpoint kept) so the next ingest retries them. Otherwise every record
/// of the dataset is deleted and the next ingest re-plans from scratch.
pub async fn reset_dataset(
    store: &dyn ProgressStore,
    dataset: &str,
    failed_only: bool,
) -> Result<u64> {
    if !failed_only {
        return store.reset(dataset).await;
    }

    let mut rearmed = 0;
    for (key, mut record) in store.list(dataset).await? {
        if record.status != BatchStatus::Failed {
            continue;
        }
        record.status = BatchStatus::Pending;
        record.attempts = 0;
        record.touch();
        store.put(dataset, &key, &record).await?;
        rearmed += 1;
    }
    Ok(rearmed)
}

pub async fn run_reset(
    config: &Config,
    env_url: Option<&str>,
    dataset: &str,
    failed_only: bool,
) -> Result<()> {
    config.dataset(dataset)?;
    let pool = db::connect(config, env_url).await?;
    migrate::migrate(&pool).await?;
    let store = progress::open_store(config, &pool);

    let n = reset_dataset(store.as_ref(), dataset, failed_only).await?;
    pool.close().await;

    if failed_only {
        println!("reset {}: re-armed {} failed batch(es)", dataset, n);
    } else {
        println!("reset {}: removed {} progress record(s)", dataset, n);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_harness_core::models::{BatchDescriptor, Granularity, IngestionRecord};
    use backfill_harness_core::progress::memory::InMemoryProgressStore;
    use chrono::NaiveDate;

    fn record(day: u32, status: BatchStatus, attempts: u32) -> IngestionRecord {
        let start = NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        let mut r = IngestionRecord::pending(BatchDescriptor {
            granularity: Granularity::Week,
            start,
            end: start + chrono::Duration::days(7),
            estimated_rows: 100,
        });
        r.status = status;
        r.attempts = attempts;
        r.processed_rows = 40;
        r
    }

    #[tokio::test]
    async fn failed_only_rearms_and_keeps_checkpoint() {
        let store = InMemoryProgressStore::new();
        let done = record(1, BatchStatus::Completed, 0);
        let failed = record(8, BatchStatus::Failed, 3);
        store.put("tx", &done.batch.key(), &done).await.unwrap();
        store.put("tx", &failed.batch.key(), &failed).await.unwrap();

        assert_eq!(reset_dataset(&store, "tx", true).await.unwrap(), 1);
        let rearmed = store.get("tx", &failed.batch.key()).await.unwrap().unwrap();
        assert_eq!(rearmed.status, BatchStatus::Pending);
        assert_eq!(rearmed.attempts, 0);
        assert_eq!(rearmed.processed_rows, 40);
        let kept = store.get("tx", &done.batch.key()).await.unwrap().unwrap();
        assert_eq!(kept.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn full_reset_removes_everything() {
        let store = InMemoryProgressStore::new();
        let done = record(1, BatchStatus::Completed, 0);
        store.put("tx", &done.batch.key(), &done).await.unwrap();
        assert_eq!(reset_dataset(&store, "tx", false).await.unwrap(), 1);
        assert!(store.list("tx").await.unwrap().is_empty());
    }
}
