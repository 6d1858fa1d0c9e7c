//! Read-only progress monitor.
//!
//! Split into three pieces so each can be tested alone:
//! [`ProgressSnapshot::capture`] reads the store once, [`render`] turns a
//! snapshot into text without side effects, and [`watch`] is the polling
//! loop that decides when to stop. Nothing here writes to the progress
//! store or the target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::BatchStatus;
use crate::progress::ProgressStore;
use crate::retry::Sleeper;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgress {
    pub key: String,
    pub status: BatchStatus,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BatchProgress {
    /// Denominator for percentages. A completed batch is exactly its
    /// processed count; otherwise the estimate, never below progress.
    fn target_rows(&self) -> u64 {
        if self.status == BatchStatus::Completed {
            self.processed_rows
        } else {
            self.total_rows.max(self.processed_rows)
        }
    }

    pub fn percent(&self) -> f64 {
        if self.status == BatchStatus::Completed {
            return 100.0;
        }
        percent(self.processed_rows, self.target_rows())
    }

    pub fn is_terminal_failure(&self, max_attempts: u32) -> bool {
        self.status == BatchStatus::Failed && self.attempts >= max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetProgress {
    pub dataset: String,
    pub batches: Vec<BatchProgress>,
}

impl DatasetProgress {
    pub fn processed_rows(&self) -> u64 {
        self.batches.iter().map(|b| b.processed_rows).sum()
    }

    pub fn total_rows(&self) -> u64 {
        self.batches.iter().map(|b| b.target_rows()).sum()
    }

    pub fn completed_batches(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.status == BatchStatus::Completed)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.batches.iter().all(|b| b.status == BatchStatus::Completed)
    }

    pub fn percent(&self) -> f64 {
        if self.is_complete() {
            return 100.0;
        }
        percent(self.processed_rows(), self.total_rows())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub taken_at: DateTime<Utc>,
    pub datasets: Vec<DatasetProgress>,
}

impl ProgressSnapshot {
    /// Read every tracked dataset (or only `only`, when non-empty).
    pub async fn capture(store: &dyn ProgressStore, only: &[String]) -> Result<Self> {
        let mut datasets = Vec::new();
        for dataset in store.datasets().await? {
            if !only.is_empty() && !only.contains(&dataset) {
                continue;
            }
            let batches = store
                .list(&dataset)
                .await?
                .into_iter()
                .map(|(key, r)| BatchProgress {
                    key,
                    status: r.status,
                    processed_rows: r.processed_rows,
                    total_rows: r.total_rows,
                    attempts: r.attempts,
                    last_error: r.last_error,
                })
                .collect();
            datasets.push(DatasetProgress { dataset, batches });
        }
        Ok(Self {
            taken_at: Utc::now(),
            datasets,
        })
    }

    pub fn processed_rows(&self) -> u64 {
        self.datasets.iter().map(|d| d.processed_rows()).sum()
    }

    pub fn total_rows(&self) -> u64 {
        self.datasets.iter().map(|d| d.total_rows()).sum()
    }

    /// At least one dataset is present and all of its batches are completed.
    /// A dataset with no batches (nothing on or after its floor) is complete.
    pub fn is_complete(&self) -> bool {
        !self.datasets.is_empty() && self.datasets.iter().all(|d| d.is_complete())
    }

    pub fn tracks(&self, dataset: &str) -> bool {
        self.datasets.iter().any(|d| d.dataset == dataset)
    }

    /// Add an empty entry for each of `datasets` not already present.
    pub fn settle(&mut self, datasets: &[String]) {
        for name in datasets {
            if !self.tracks(name) {
                self.datasets.push(DatasetProgress {
                    dataset: name.clone(),
                    batches: Vec::new(),
                });
            }
        }
    }

    /// Something is unfinished and every unfinished batch has exhausted its
    /// attempts, so waiting longer cannot change anything.
    pub fn is_stalled(&self, max_attempts: u32) -> bool {
        let mut unfinished = self
            .datasets
            .iter()
            .flat_map(|d| d.batches.iter())
            .filter(|b| b.status != BatchStatus::Completed)
            .peekable();
        unfinished.peek().is_some() && unfinished.all(|b| b.is_terminal_failure(max_attempts))
    }

    pub fn percent(&self) -> f64 {
        if self.is_complete() {
            return 100.0;
        }
        percent(self.processed_rows(), self.total_rows())
    }
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 * 100.0 / total as f64).min(100.0)
}

/// Format a number with thousands separators (e.g. 1,234,567).
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Render a snapshot as a fixed-width text report.
pub fn render(snapshot: &ProgressSnapshot, max_attempts: u32) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Backfill progress ({})\n",
        snapshot.taken_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    if snapshot.datasets.is_empty() {
        out.push_str("\n  No datasets tracked yet.\n");
        return out;
    }

    out.push_str(&format!(
        "\n  {:<16} {:<24} {:<10} {:>12} {:>12} {:>7}  {}\n",
        "DATASET", "BATCH", "STATUS", "PROCESSED", "TOTAL", "PCT", "NOTE"
    ));
    out.push_str(&format!("  {}\n", "-".repeat(96)));

    for d in &snapshot.datasets {
        for b in &d.batches {
            let note = if b.is_terminal_failure(max_attempts) {
                format!(
                    "TERMINAL after {} attempts: {}",
                    b.attempts,
                    b.last_error.as_deref().unwrap_or("")
                )
            } else if let Some(err) = &b.last_error {
                format!("attempt {}/{}: {}", b.attempts, max_attempts, err)
            } else {
                String::new()
            };
            out.push_str(&format!(
                "  {:<16} {:<24} {:<10} {:>12} {:>12} {:>6.1}%  {}\n",
                d.dataset,
                b.key,
                b.status.as_str(),
                format_number(b.processed_rows),
                format_number(b.target_rows()),
                b.percent(),
                note
            ));
        }
        out.push_str(&format!(
            "  {:<16} {:<24} {:<10} {:>12} {:>12} {:>6.1}%\n",
            d.dataset,
            format!("({}/{} batches)", d.completed_batches(), d.batches.len()),
            "",
            format_number(d.processed_rows()),
            format_number(d.total_rows()),
            d.percent()
        ));
        out.push('\n');
    }

    out.push_str(&format!(
        "  Overall: {} / {} rows ({:.1}%)\n",
        format_number(snapshot.processed_rows()),
        format_number(snapshot.total_rows()),
        snapshot.percent()
    ));
    out
}

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub interval: Duration,
    /// Used to tell retryable failures from terminal ones.
    pub max_attempts: u32,
    /// Stop after this many polls (`Some(1)` renders once).
    pub max_polls: Option<u64>,
    /// Datasets to watch; empty means all tracked datasets. Completion waits
    /// until every named dataset shows up in the store.
    pub datasets: Vec<String>,
    /// Datasets known to plan to nothing. They never register records and
    /// count as complete.
    pub empty: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Every tracked batch is completed.
    Completed,
    /// Only terminal failures remain.
    Stalled,
    /// The operator interrupted the monitor.
    Interrupted,
    /// `max_polls` reached with work still outstanding.
    PollLimit,
}

/// Poll the store until completion, stall, interrupt, or the poll limit.
///
/// A failed poll is logged and retried on the next tick; the monitor does
/// not exit because the store is briefly unavailable.
pub async fn watch<F>(
    store: &dyn ProgressStore,
    options: &MonitorOptions,
    sleeper: &dyn Sleeper,
    interrupt: &AtomicBool,
    mut on_snapshot: F,
) -> Result<MonitorExit>
where
    F: FnMut(&ProgressSnapshot),
{
    let mut polls = 0u64;
    loop {
        if interrupt.load(Ordering::SeqCst) {
            return Ok(MonitorExit::Interrupted);
        }
        polls += 1;

        match ProgressSnapshot::capture(store, &options.datasets).await {
            Ok(mut snapshot) => {
                snapshot.settle(&options.empty);
                on_snapshot(&snapshot);
                let all_seen = options.datasets.iter().all(|d| snapshot.tracks(d));
                if all_seen && snapshot.is_complete() {
                    return Ok(MonitorExit::Completed);
                }
                if snapshot.is_stalled(options.max_attempts) {
                    return Ok(MonitorExit::Stalled);
                }
            }
            Err(e) => {
                tracing::warn!(poll = polls, error = %format!("{:#}", e), "progress poll failed; retrying");
            }
        }

        if options.max_polls.is_some_and(|max| polls >= max) {
            return Ok(MonitorExit::PollLimit);
        }
        sleeper.sleep(options.interval).await;
    }
}
