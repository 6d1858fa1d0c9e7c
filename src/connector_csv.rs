//! CSV file source.
//!
//! The first row is the header. Every cell becomes a JSON string field
//! (empty cells become `null`); values are not coerced, so identifiers such
//! as `"00042"` keep their leading zeros. Rows are streamed in file order.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, Trim};
use serde_json::{Map, Value};

use backfill_harness_core::models::{Interval, SourceRecord};
use backfill_harness_core::period;
use backfill_harness_core::source::{RecordStream, Source, TimestampStream};

use crate::sources::blocking_stream;

pub struct CsvSource {
    path: PathBuf,
    timestamp_field: String,
}

impl CsvSource {
    pub fn new(path: PathBuf, timestamp_field: String) -> Self {
        Self {
            path,
            timestamp_field,
        }
    }
}

/// Call `visit` for every data row with its parsed timestamp. Stops early
/// when `visit` returns `false`.
fn for_each_row<F>(path: &Path, timestamp_field: &str, mut visit: F) -> Result<()>
where
    F: FnMut(Option<DateTime<Utc>>, Map<String, Value>) -> bool,
{
    let mut rdr = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let headers = rdr
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    let ts_index = match headers.iter().position(|h| h == timestamp_field) {
        Some(i) => i,
        None => bail!(
            "timestamp column '{}' not found in {}",
            timestamp_field,
            path.display()
        ),
    };

    for (line, result) in rdr.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) if e.is_io_error() => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), line = line + 2, error = %e, "malformed csv row");
                if !visit(None, Map::new()) {
                    return Ok(());
                }
                continue;
            }
        };

        let ts = record.get(ts_index).and_then(period::parse_timestamp);
        let mut fields = Map::with_capacity(headers.len());
        for (name, cell) in headers.iter().zip(record.iter()) {
            let value = if cell.is_empty() {
                Value::Null
            } else {
                Value::String(cell.to_string())
            };
            fields.insert(name.to_string(), value);
        }
        if !visit(ts, fields) {
            return Ok(());
        }
    }
    Ok(())
}

#[async_trait]
impl Source for CsvSource {
    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }

    async fn count(&self) -> Result<u64> {
        let path = self.path.clone();
        let field = self.timestamp_field.clone();
        tokio::task::spawn_blocking(move || {
            let mut n = 0u64;
            for_each_row(&path, &field, |_, _| {
                n += 1;
                true
            })?;
            Ok(n)
        })
        .await?
    }

    async fn scan_timestamps(&self) -> Result<TimestampStream> {
        let path = self.path.clone();
        let field = self.timestamp_field.clone();
        Ok(blocking_stream(move |emit| {
            for_each_row(&path, &field, |ts, _| emit.send(Ok(ts)))
        }))
    }

    async fn stream(&self, interval: Interval) -> Result<RecordStream> {
        let path = self.path.clone();
        let field = self.timestamp_field.clone();
        Ok(blocking_stream(move |emit| {
            for_each_row(&path, &field, |ts, fields| match ts {
                Some(timestamp) if interval.contains(&timestamp) => {
                    emit.send(Ok(SourceRecord { timestamp, fields }))
                }
                _ => true,
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use futures::StreamExt;

    fn write_csv(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("tx.csv");
        std::fs::write(&path, body).unwrap();
        path
    }

    const BODY: &str = "\
txn_id,created_at,amount
00001,2024-01-03T10:00:00Z,9.99
00002,2024-01-20 08:00:00,
00003,not a date,1.00
00004,2024-02-11,4.50
";

    #[tokio::test]
    async fn counts_all_rows_and_streams_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let src = CsvSource::new(write_csv(&dir, BODY), "created_at".into());
        assert_eq!(src.count().await.unwrap(), 4);

        let stamps: Vec<_> = src
            .scan_timestamps()
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(stamps.len(), 4);
        assert!(stamps[2].is_none());

        let jan = Interval::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        );
        let records: Vec<_> = src
            .stream(jan)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fields["txn_id"], "00001");
        assert_eq!(records[1].fields["amount"], Value::Null);

        let from_feb = Interval::from_floor(NaiveDate::from_ymd_opt(2024, 2, 1));
        let records: Vec<_> = src.stream(from_feb).await.unwrap().collect().await;
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn restreaming_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let src = CsvSource::new(write_csv(&dir, BODY), "created_at".into());
        let all = Interval::from_floor(None);
        let a: Vec<_> = src.stream(all).await.unwrap().map(|r| r.unwrap()).collect().await;
        let b: Vec<_> = src.stream(all).await.unwrap().map(|r| r.unwrap()).collect().await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn missing_timestamp_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = CsvSource::new(write_csv(&dir, BODY), "ts".into());
        assert!(src.count().await.is_err());
        let items: Vec<_> = src
            .stream(Interval::from_floor(None))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }
}
