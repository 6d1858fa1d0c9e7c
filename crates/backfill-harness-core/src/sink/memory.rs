//! In-memory [`Sink`] for tests.
//!
//! Mirrors the SQLite sink's semantics: surrogate ids in insertion order,
//! upsert-or-ignore by `(dataset, natural_key)`, a unique index that can be
//! installed through [`Sink::execute_ddl`], and fault injection so retry
//! paths can be exercised.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{DatasetStats, TargetRow};

use super::{ChunkOutcome, KeyColumns, RowFilter, Sink, SinkError, WriteOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: u64,
    pub dataset: String,
    pub row: TargetRow,
}

#[derive(Default)]
struct State {
    rows: Vec<StoredRow>,
    next_id: u64,
    unique: Option<KeyColumns>,
    ddl: Vec<String>,
}

#[derive(Default)]
pub struct InMemorySink {
    state: RwLock<State>,
    faults: Mutex<VecDeque<SinkError>>,
}

fn poisoned<T>(_: T) -> SinkError {
    SinkError::Transient("sink lock poisoned".to_string())
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write calls fail with these errors, in order.
    pub fn inject_faults(&self, faults: impl IntoIterator<Item = SinkError>) {
        if let Ok(mut queue) = self.faults.lock() {
            queue.extend(faults);
        }
    }

    /// Plain insert that bypasses the natural-key check, like a legacy
    /// loader would. Fails only if a unique index forbids it.
    pub fn insert_unchecked(&self, dataset: &str, row: TargetRow) -> Result<u64, SinkError> {
        let mut state = self.state.write().map_err(poisoned)?;
        if let Some(unique) = &state.unique {
            let candidate = StoredRow {
                id: 0,
                dataset: dataset.to_string(),
                row: row.clone(),
            };
            let key = key_of(&candidate, unique)?;
            for existing in &state.rows {
                if key_of(existing, unique)? == key {
                    return Err(SinkError::Rejected(format!(
                        "UNIQUE constraint failed: {}",
                        unique.joined()
                    )));
                }
            }
        }
        Ok(push_row(&mut state, dataset, row))
    }

    pub fn rows(&self) -> Vec<StoredRow> {
        self.state
            .read()
            .map(|s| s.rows.clone())
            .unwrap_or_default()
    }

    pub fn executed_ddl(&self) -> Vec<String> {
        self.state.read().map(|s| s.ddl.clone()).unwrap_or_default()
    }

    pub fn unique_enforced(&self) -> bool {
        self.state.read().map(|s| s.unique.is_some()).unwrap_or(false)
    }

    fn take_fault(&self) -> Option<SinkError> {
        self.faults.lock().ok().and_then(|mut q| q.pop_front())
    }
}

fn push_row(state: &mut State, dataset: &str, row: TargetRow) -> u64 {
    state.next_id += 1;
    let id = state.next_id;
    state.rows.push(StoredRow {
        id,
        dataset: dataset.to_string(),
        row,
    });
    id
}

fn upsert(state: &mut State, dataset: &str, row: &TargetRow) -> WriteOutcome {
    let mut found = false;
    let mut merged = false;
    for existing in state
        .rows
        .iter_mut()
        .filter(|r| r.dataset == dataset && r.row.natural_key == row.natural_key)
    {
        found = true;
        if existing.row.record_ts < row.record_ts {
            existing.row = row.clone();
            merged = true;
        }
    }
    if !found {
        push_row(state, dataset, row.clone());
        WriteOutcome::Inserted
    } else if merged {
        WriteOutcome::Merged
    } else {
        WriteOutcome::DuplicateIgnored
    }
}

fn key_of(row: &StoredRow, key: &KeyColumns) -> Result<Vec<String>, SinkError> {
    key.columns()
        .iter()
        .map(|col| match col.as_str() {
            "dataset" => Ok(row.dataset.clone()),
            "natural_key" => Ok(row.row.natural_key.clone()),
            other => Err(SinkError::Rejected(format!("no such column: {}", other))),
        })
        .collect()
}

/// Pull the column list out of `CREATE UNIQUE INDEX ... ON t (a, b)`.
fn unique_index_columns(statement: &str) -> Option<Vec<String>> {
    let upper = statement.trim_start().to_ascii_uppercase();
    if !upper.starts_with("CREATE UNIQUE INDEX") {
        return None;
    }
    let open = statement.rfind('(')?;
    let close = statement.rfind(')')?;
    if close <= open {
        return None;
    }
    Some(
        statement[open + 1..close]
            .split(',')
            .map(|c| c.trim().to_string())
            .collect(),
    )
}

#[async_trait]
impl Sink for InMemorySink {
    fn table(&self) -> &str {
        "target_rows"
    }

    async fn upsert_or_ignore(
        &self,
        dataset: &str,
        row: &TargetRow,
    ) -> Result<WriteOutcome, SinkError> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let mut state = self.state.write().map_err(poisoned)?;
        Ok(upsert(&mut state, dataset, row))
    }

    async fn write_chunk(&self, dataset: &str, rows: &[TargetRow]) -> Result<ChunkOutcome, SinkError> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let mut state = self.state.write().map_err(poisoned)?;
        let mut outcome = ChunkOutcome::default();
        for row in rows {
            outcome.record(upsert(&mut state, dataset, row));
        }
        Ok(outcome)
    }

    async fn count(&self, filter: &RowFilter) -> Result<u64, SinkError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .rows
            .iter()
            .filter(|r| r.dataset == filter.dataset)
            .filter(|r| {
                filter
                    .interval
                    .map_or(true, |iv| iv.contains(&r.row.record_ts))
            })
            .count() as u64)
    }

    async fn stats(&self, dataset: &str) -> Result<DatasetStats, SinkError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut keys = HashSet::new();
        let mut stats = DatasetStats::default();
        let mut first: Option<DateTime<Utc>> = None;
        let mut last: Option<DateTime<Utc>> = None;
        for r in state.rows.iter().filter(|r| r.dataset == dataset) {
            stats.rows += 1;
            keys.insert(r.row.natural_key.as_str());
            let ts = r.row.record_ts;
            first = Some(first.map_or(ts, |f| f.min(ts)));
            last = Some(last.map_or(ts, |l| l.max(ts)));
        }
        stats.distinct_keys = keys.len() as u64;
        stats.first_ts = first;
        stats.last_ts = last;
        Ok(stats)
    }

    async fn remove_duplicates(&self, key: &KeyColumns) -> Result<u64, SinkError> {
        let mut state = self.state.write().map_err(poisoned)?;

        let mut keep: HashMap<Vec<String>, (DateTime<Utc>, u64)> = HashMap::new();
        for r in &state.rows {
            let k = key_of(r, key)?;
            let candidate = (r.row.record_ts, r.id);
            keep.entry(k)
                .and_modify(|best| {
                    if candidate > *best {
                        *best = candidate;
                    }
                })
                .or_insert(candidate);
        }
        let survivors: HashSet<u64> = keep.values().map(|(_, id)| *id).collect();

        let before = state.rows.len();
        state.rows.retain(|r| survivors.contains(&r.id));
        Ok((before - state.rows.len()) as u64)
    }

    async fn execute_ddl(&self, statement: &str) -> Result<(), SinkError> {
        let mut state = self.state.write().map_err(poisoned)?;
        if let Some(columns) = unique_index_columns(statement) {
            let key = KeyColumns::new(&columns).map_err(|e| SinkError::Rejected(e.to_string()))?;
            let mut seen = HashSet::new();
            for r in &state.rows {
                if !seen.insert(key_of(r, &key)?) {
                    return Err(SinkError::Rejected(format!(
                        "UNIQUE constraint failed: {}",
                        key.joined()
                    )));
                }
            }
            state.unique = Some(key);
        }
        state.ddl.push(statement.to_string());
        Ok(())
    }
}
