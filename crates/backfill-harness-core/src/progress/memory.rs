//! In-memory [`ProgressStore`] for tests.
//!
//! Uses a `BTreeMap` behind `std::sync::RwLock`; batch keys sort
//! chronologically so `list` needs no extra ordering.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::IngestionRecord;

use super::ProgressStore;

type Records = BTreeMap<String, BTreeMap<String, IngestionRecord>>;

pub struct InMemoryProgressStore {
    records: RwLock<Records>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("progress store lock poisoned")
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn get(&self, dataset: &str, batch: &str) -> Result<Option<IngestionRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(dataset).and_then(|d| d.get(batch)).cloned())
    }

    async fn put(&self, dataset: &str, batch: &str, record: &IngestionRecord) -> Result<()> {
        let mut records = self.records.write().map_err(poisoned)?;
        records
            .entry(dataset.to_string())
            .or_default()
            .insert(batch.to_string(), record.clone());
        Ok(())
    }

    async fn list(&self, dataset: &str) -> Result<Vec<(String, IngestionRecord)>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .get(dataset)
            .map(|d| d.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn datasets(&self) -> Result<Vec<String>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .iter()
            .filter(|(_, batches)| !batches.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn reset(&self, dataset: &str) -> Result<u64> {
        let mut records = self.records.write().map_err(poisoned)?;
        Ok(records.remove(dataset).map(|d| d.len() as u64).unwrap_or(0))
    }
}
