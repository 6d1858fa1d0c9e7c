//! Duplicate removal and uniqueness enforcement.
//!
//! [`dedupe`] collapses rows sharing a natural key down to the latest one in
//! a single set-based statement. [`enforce_uniqueness`] then installs a
//! unique index so a later duplicate write fails at the sink instead of
//! landing silently; the engine's upsert-or-ignore path already treats that
//! case as "keep existing".

use anyhow::{Context, Result};
use serde::Serialize;

use crate::sink::{KeyColumns, Sink};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupeReport {
    pub table: String,
    pub key_columns: Vec<String>,
    pub removed: u64,
    /// DDL executed by [`enforce_uniqueness`], when it ran.
    pub index: Option<String>,
}

/// Name of the unique index for `key` on `table`.
pub fn unique_index_name(table: &str, key: &KeyColumns) -> String {
    format!("ux_{}_{}", table, key.columns().join("_"))
}

pub fn unique_index_ddl(table: &str, key: &KeyColumns) -> String {
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
        unique_index_name(table, key),
        table,
        key.joined()
    )
}

/// Delete every row but the latest per natural key. Returns rows removed.
pub async fn dedupe(sink: &dyn Sink, key: &KeyColumns) -> Result<u64> {
    let removed = sink
        .remove_duplicates(key)
        .await
        .with_context(|| format!("failed to remove duplicates on ({})", key.joined()))?;
    tracing::info!(table = sink.table(), key = %key.joined(), removed, "duplicates removed");
    Ok(removed)
}

/// Install a unique index on `key`. Fails if duplicates still exist.
pub async fn enforce_uniqueness(sink: &dyn Sink, key: &KeyColumns) -> Result<String> {
    let ddl = unique_index_ddl(sink.table(), key);
    sink.execute_ddl(&ddl)
        .await
        .with_context(|| format!("failed to enforce uniqueness on ({})", key.joined()))?;
    tracing::info!(table = sink.table(), key = %key.joined(), "unique index installed");
    Ok(ddl)
}

/// [`dedupe`] followed, when `enforce` is set, by [`enforce_uniqueness`].
pub async fn run(sink: &dyn Sink, key: &KeyColumns, enforce: bool) -> Result<DedupeReport> {
    let removed = dedupe(sink, key).await?;
    let index = if enforce {
        Some(enforce_uniqueness(sink, key).await?)
    } else {
        None
    };
    Ok(DedupeReport {
        table: sink.table().to_string(),
        key_columns: key.columns().to_vec(),
        removed,
        index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetRow;
    use crate::sink::memory::InMemorySink;
    use crate::sink::WriteOutcome;
    use chrono::{TimeZone, Utc};

    fn row(key: &str, day: u32, payload: &str) -> TargetRow {
        TargetRow {
            natural_key: key.to_string(),
            record_ts: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            payload_json: payload.to_string(),
            payload_hash: format!("{}-{}", key, day),
        }
    }

    fn key() -> KeyColumns {
        KeyColumns::new(&["dataset", "natural_key"]).unwrap()
    }

    #[test]
    fn ddl_is_idempotent_statement() {
        assert_eq!(
            unique_index_ddl("target_rows", &key()),
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_target_rows_dataset_natural_key \
             ON target_rows (dataset, natural_key)"
        );
    }

    #[tokio::test]
    async fn keeps_latest_and_locks_key() {
        let sink = InMemorySink::new();
        sink.insert_unchecked("mail", row("m1", 1, "old")).unwrap();
        sink.insert_unchecked("mail", row("m1", 9, "new")).unwrap();
        sink.insert_unchecked("mail", row("m1", 5, "mid")).unwrap();
        sink.insert_unchecked("mail", row("m2", 2, "only")).unwrap();

        let report = run(&sink, &key(), true).await.unwrap();
        assert_eq!(report.removed, 2);
        assert!(report.index.is_some());

        let rows = sink.rows();
        assert_eq!(rows.len(), 2);
        let m1 = rows.iter().find(|r| r.row.natural_key == "m1").unwrap();
        assert_eq!(m1.row.payload_json, "new");

        // Legacy blind inserts now fail; engine writes still resolve.
        assert!(sink.insert_unchecked("mail", row("m1", 10, "x")).is_err());
        assert_eq!(
            sink.upsert_or_ignore("mail", &row("m1", 3, "stale")).await.unwrap(),
            WriteOutcome::DuplicateIgnored
        );
    }

    #[tokio::test]
    async fn timestamp_tie_keeps_latest_inserted() {
        let sink = InMemorySink::new();
        sink.insert_unchecked("mail", row("m1", 4, "first")).unwrap();
        sink.insert_unchecked("mail", row("m1", 4, "second")).unwrap();
        assert_eq!(dedupe(&sink, &key()).await.unwrap(), 1);
        assert_eq!(sink.rows()[0].row.payload_json, "second");
    }

    #[tokio::test]
    async fn enforce_fails_while_duplicates_remain() {
        let sink = InMemorySink::new();
        sink.insert_unchecked("mail", row("m1", 1, "a")).unwrap();
        sink.insert_unchecked("mail", row("m1", 2, "b")).unwrap();
        assert!(enforce_uniqueness(&sink, &key()).await.is_err());
        assert!(!sink.unique_enforced());
    }

    #[tokio::test]
    async fn clean_table_removes_nothing() {
        let sink = InMemorySink::new();
        sink.insert_unchecked("mail", row("m1", 1, "a")).unwrap();
        assert_eq!(dedupe(&sink, &key()).await.unwrap(), 0);
    }
}
