//! `backfill monitor`: poll the progress store and print a report per
//! dataset until everything completes, only terminal failures remain, or
//! the operator presses Ctrl-C.
//!
//! A dataset with nothing on or after its date floor never registers any
//! batches. Before polling, untracked datasets are profiled once (read-only)
//! so those count as complete instead of keeping the monitor waiting.

use std::time::Duration;

use anyhow::{bail, Result};

use backfill_harness_core::distribution;
use backfill_harness_core::monitor::{self, MonitorExit, MonitorOptions};
use backfill_harness_core::progress::ProgressStore;

use crate::clock::TokioSleeper;
use crate::config::Config;
use crate::db;
use crate::ingest::interrupt_flag;
use crate::migrate;
use crate::progress;
use crate::sources::build_source;

pub async fn run_monitor(
    config: &Config,
    env_url: Option<&str>,
    datasets: Vec<String>,
    once: bool,
) -> Result<()> {
    for name in &datasets {
        config.dataset(name)?;
    }
    let pool = db::connect(config, env_url).await?;
    migrate::migrate(&pool).await?;
    let store = progress::open_store(config, &pool);

    let candidates = if datasets.is_empty() {
        config.dataset_names()
    } else {
        datasets.clone()
    };
    let empty = empty_datasets(config, store.as_ref(), &candidates).await;

    let options = MonitorOptions {
        interval: Duration::from_secs(config.monitor.interval_secs),
        max_attempts: config.ingest.max_attempts,
        max_polls: if once { Some(1) } else { None },
        datasets,
        empty,
    };
    let interrupt = interrupt_flag();
    let max_attempts = options.max_attempts;

    let exit = monitor::watch(store.as_ref(), &options, &TokioSleeper, &interrupt, |snapshot| {
        println!("{}", monitor::render(snapshot, max_attempts));
    })
    .await;
    pool.close().await;

    match exit? {
        MonitorExit::Completed => {
            println!("all batches completed");
            Ok(())
        }
        MonitorExit::Stalled => {
            bail!("ingestion stalled: only terminal failures remain (see `backfill reset --failed-only`)")
        }
        MonitorExit::Interrupted | MonitorExit::PollLimit => Ok(()),
    }
}

/// Untracked datasets among `names` whose source has no rows on or after
/// the floor. Anything that cannot be profiled is left out, so the monitor
/// keeps waiting for its plan.
async fn empty_datasets(config: &Config, store: &dyn ProgressStore, names: &[String]) -> Vec<String> {
    let tracked = match store.datasets().await {
        Ok(tracked) => tracked,
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "could not list tracked datasets");
            return Vec::new();
        }
    };

    let mut empty = Vec::new();
    for name in names.iter().filter(|n| !tracked.contains(n)) {
        let (Ok(dataset), Ok(floor)) = (config.dataset(name), config.date_floor(name)) else {
            continue;
        };
        match distribution::analyze(build_source(dataset).as_ref(), floor).await {
            Ok(profile) if profile.is_empty() => empty.push(name.clone()),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(dataset = %name, error = %format!("{:#}", e), "could not profile source")
            }
        }
    }
    empty
}
