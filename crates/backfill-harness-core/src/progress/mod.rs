//! Durable per-batch progress.
//!
//! The [`ProgressStore`] trait maps `(dataset, batch_key)` to an
//! [`IngestionRecord`]. It is the single source of truth for what remains
//! to be done; the engine consults it before every batch and the monitor
//! reads it to render status.
//!
//! Every `put` must be atomic at record granularity: a reader never sees a
//! partially written record, even if the writer dies mid-call.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{BatchDescriptor, IngestionRecord};

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(&self, dataset: &str, batch: &str) -> Result<Option<IngestionRecord>>;

    /// Insert or replace one record.
    async fn put(&self, dataset: &str, batch: &str, record: &IngestionRecord) -> Result<()>;

    /// All records of a dataset, ordered by batch key (chronological).
    async fn list(&self, dataset: &str) -> Result<Vec<(String, IngestionRecord)>>;

    /// Datasets that have at least one record.
    async fn datasets(&self) -> Result<Vec<String>>;

    /// Delete every record of a dataset. Returns how many were removed.
    async fn reset(&self, dataset: &str) -> Result<u64>;

    /// Batch keys whose status is not `Completed`.
    async fn list_incomplete(&self, dataset: &str) -> Result<Vec<String>> {
        Ok(self
            .list(dataset)
            .await?
            .into_iter()
            .filter(|(_, record)| !record.is_completed())
            .map(|(key, _)| key)
            .collect())
    }
}

/// Create `Pending` records for every batch of `plan` that has none yet.
pub async fn register_plan(
    store: &dyn ProgressStore,
    dataset: &str,
    plan: &[BatchDescriptor],
) -> Result<usize> {
    let mut created = 0;
    for batch in plan {
        let key = batch.key();
        if store.get(dataset, &key).await?.is_none() {
            store
                .put(dataset, &key, &IngestionRecord::pending(batch.clone()))
                .await?;
            created += 1;
        }
    }
    Ok(created)
}

/// The plan registered by an earlier run, if any.
pub async fn frozen_plan(
    store: &dyn ProgressStore,
    dataset: &str,
) -> Result<Option<Vec<BatchDescriptor>>> {
    let records = store.list(dataset).await?;
    if records.is_empty() {
        return Ok(None);
    }
    Ok(Some(records.into_iter().map(|(_, r)| r.batch).collect()))
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryProgressStore;
    use super::*;
    use crate::models::{BatchStatus, Granularity};
    use chrono::NaiveDate;

    fn month(m: u32, rows: u64) -> BatchDescriptor {
        BatchDescriptor {
            granularity: Granularity::Month,
            start: NaiveDate::from_ymd_opt(2024, m, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, m + 1, 1).unwrap(),
            estimated_rows: rows,
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_and_preserves_state() {
        let store = InMemoryProgressStore::new();
        let plan = vec![month(1, 10), month(2, 20)];
        assert_eq!(register_plan(&store, "tx", &plan).await.unwrap(), 2);

        let key = plan[0].key();
        let mut rec = store.get("tx", &key).await.unwrap().unwrap();
        rec.status = BatchStatus::Completed;
        store.put("tx", &key, &rec).await.unwrap();

        assert_eq!(register_plan(&store, "tx", &plan).await.unwrap(), 0);
        assert!(store.get("tx", &key).await.unwrap().unwrap().is_completed());
        assert_eq!(store.list_incomplete("tx").await.unwrap(), vec![plan[1].key()]);
    }

    #[tokio::test]
    async fn frozen_plan_round_trips() {
        let store = InMemoryProgressStore::new();
        assert!(frozen_plan(&store, "tx").await.unwrap().is_none());
        let plan = vec![month(1, 10), month(2, 20), month(3, 5)];
        register_plan(&store, "tx", &plan).await.unwrap();
        assert_eq!(frozen_plan(&store, "tx").await.unwrap().unwrap(), plan);
    }
}
