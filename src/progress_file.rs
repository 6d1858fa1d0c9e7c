//! JSON-file [`ProgressStore`].
//!
//! The file is a human-readable mapping `dataset -> batch_key -> record`:
//!
//! ```json
//! {
//!   "transactions": {
//!     "2024-01-01..2024-02-01": {
//!       "granularity": "month", "start": "2024-01-01", "end": "2024-02-01",
//!       "estimated_rows": 3400, "status": "completed",
//!       "processed_rows": 3400, "total_rows": 3400, "attempts": 0, ...
//!     }
//!   }
//! }
//! ```
//!
//! Every `put` rewrites the whole file through a uniquely named temp file
//! and an atomic rename, so readers (including a monitor in another
//! process) see either the old or the new state. Writers inside one process
//! are serialized by a mutex; run at most one writing process per file, or
//! use the SQLite backend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use backfill_harness_core::models::IngestionRecord;
use backfill_harness_core::progress::ProgressStore;

type Records = BTreeMap<String, BTreeMap<String, IngestionRecord>>;

pub struct FileProgressStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Records> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Records::new()),
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("corrupt progress file: {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Records::new()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to read progress file: {}", self.path.display())),
        }
    }

    async fn save(&self, records: &Records) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "progress.json".to_string());
        let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

        let body = serde_json::to_vec_pretty(records)?;
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| {
                format!("failed to replace progress file: {}", self.path.display())
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn get(&self, dataset: &str, batch: &str) -> Result<Option<IngestionRecord>> {
        let records = self.load().await?;
        Ok(records.get(dataset).and_then(|d| d.get(batch)).cloned())
    }

    async fn put(&self, dataset: &str, batch: &str, record: &IngestionRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        records
            .entry(dataset.to_string())
            .or_default()
            .insert(batch.to_string(), record.clone());
        self.save(&records).await
    }

    async fn list(&self, dataset: &str) -> Result<Vec<(String, IngestionRecord)>> {
        let mut records = self.load().await?;
        Ok(records
            .remove(dataset)
            .map(|d| d.into_iter().collect())
            .unwrap_or_default())
    }

    async fn datasets(&self) -> Result<Vec<String>> {
        let records = self.load().await?;
        Ok(records
            .into_iter()
            .filter(|(_, batches)| !batches.is_empty())
            .map(|(name, _)| name)
            .collect())
    }

    async fn reset(&self, dataset: &str) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        let removed = records.remove(dataset).map(|d| d.len() as u64).unwrap_or(0);
        if removed > 0 {
            self.save(&records).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_harness_core::models::{BatchDescriptor, BatchStatus, Granularity};
    use backfill_harness_core::progress::{frozen_plan, register_plan};
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn month(m: u32) -> BatchDescriptor {
        BatchDescriptor {
            granularity: Granularity::Month,
            start: NaiveDate::from_ymd_opt(2024, m, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, m + 1, 1).unwrap(),
            estimated_rows: 100 * m as u64,
        }
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/progress.json");
        let plan = vec![month(1), month(2)];

        {
            let store = FileProgressStore::new(&path);
            register_plan(&store, "tx", &plan).await.unwrap();
            let mut rec = store.get("tx", &plan[0].key()).await.unwrap().unwrap();
            rec.status = BatchStatus::Running;
            rec.processed_rows = 40;
            store.put("tx", &plan[0].key(), &rec).await.unwrap();
        }

        let store = FileProgressStore::new(&path);
        let rec = store.get("tx", &plan[0].key()).await.unwrap().unwrap();
        assert_eq!(rec.status, BatchStatus::Running);
        assert_eq!(rec.processed_rows, 40);
        assert_eq!(frozen_plan(&store, "tx").await.unwrap().unwrap(), plan);
        assert_eq!(store.datasets().await.unwrap(), vec!["tx"]);

        // Human-readable and keyed by dataset, then batch.
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["tx"]["2024-01-01..2024-02-01"]["status"], "running");

        // No temp files left behind.
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn missing_file_is_empty_and_corrupt_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let store = FileProgressStore::new(&path);
        assert!(store.datasets().await.unwrap().is_empty());
        assert!(store.get("tx", "x").await.unwrap().is_none());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(store.list("tx").await.is_err());
    }

    #[tokio::test]
    async fn concurrent_puts_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileProgressStore::new(dir.path().join("progress.json")));

        let mut handles = Vec::new();
        for m in 1..=6 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let b = month(m);
                let rec = IngestionRecord::pending(b.clone());
                store.put(&format!("ds{}", m % 2), &b.key(), &rec).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.list("ds0").await.unwrap().len(), 3);
        assert_eq!(store.list("ds1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn reset_removes_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProgressStore::new(dir.path().join("progress.json"));
        register_plan(&store, "tx", &[month(1), month(2)]).await.unwrap();
        register_plan(&store, "mail", &[month(1)]).await.unwrap();
        assert_eq!(store.reset("tx").await.unwrap(), 2);
        assert_eq!(store.datasets().await.unwrap(), vec!["mail"]);
        assert_eq!(store.reset("tx").await.unwrap(), 0);
    }
}
