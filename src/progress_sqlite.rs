//! SQLite [`ProgressStore`] over the `ingestion_progress` table.
//!
//! Safe for several processes at once: each `put` is a single
//! `INSERT ... ON CONFLICT DO UPDATE` statement.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use backfill_harness_core::models::{BatchDescriptor, IngestionRecord};
use backfill_harness_core::progress::ProgressStore;

pub struct SqliteProgressStore {
    pool: SqlitePool,
}

impl SqliteProgressStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "batch_key, granularity, start_date, end_date, estimated_rows, \
     status, processed_rows, total_rows, skipped_rows, attempts, last_error, updated_at";

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("bad date in progress row: {}", raw))
}

fn record_from_row(row: &SqliteRow) -> Result<(String, IngestionRecord)> {
    let key: String = row.try_get("batch_key")?;
    let granularity: String = row.try_get("granularity")?;
    let start: String = row.try_get("start_date")?;
    let end: String = row.try_get("end_date")?;
    let status: String = row.try_get("status")?;

    let record = IngestionRecord {
        batch: BatchDescriptor {
            granularity: granularity.parse()?,
            start: parse_date(&start)?,
            end: parse_date(&end)?,
            estimated_rows: row.try_get::<i64, _>("estimated_rows")? as u64,
        },
        status: status.parse()?,
        processed_rows: row.try_get::<i64, _>("processed_rows")? as u64,
        total_rows: row.try_get::<i64, _>("total_rows")? as u64,
        skipped_rows: row.try_get::<i64, _>("skipped_rows")? as u64,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        last_error: row.try_get("last_error")?,
        updated_at: row.try_get("updated_at")?,
    };
    Ok((key, record))
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    async fn get(&self, dataset: &str, batch: &str) -> Result<Option<IngestionRecord>> {
        let sql = format!(
            "SELECT {} FROM ingestion_progress WHERE dataset = ? AND batch_key = ?",
            SELECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(dataset)
            .bind(batch)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| record_from_row(&r).map(|(_, rec)| rec)).transpose()
    }

    async fn put(&self, dataset: &str, batch: &str, record: &IngestionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_progress (
                dataset, batch_key, granularity, start_date, end_date, estimated_rows,
                status, processed_rows, total_rows, skipped_rows, attempts, last_error, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(dataset, batch_key) DO UPDATE SET
                granularity = excluded.granularity,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                estimated_rows = excluded.estimated_rows,
                status = excluded.status,
                processed_rows = excluded.processed_rows,
                total_rows = excluded.total_rows,
                skipped_rows = excluded.skipped_rows,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(dataset)
        .bind(batch)
        .bind(record.batch.granularity.as_str())
        .bind(record.batch.start.to_string())
        .bind(record.batch.end.to_string())
        .bind(record.batch.estimated_rows as i64)
        .bind(record.status.as_str())
        .bind(record.processed_rows as i64)
        .bind(record.total_rows as i64)
        .bind(record.skipped_rows as i64)
        .bind(record.attempts as i64)
        .bind(&record.last_error)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, dataset: &str) -> Result<Vec<(String, IngestionRecord)>> {
        let sql = format!(
            "SELECT {} FROM ingestion_progress WHERE dataset = ? ORDER BY batch_key",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(dataset).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn datasets(&self) -> Result<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT dataset FROM ingestion_progress ORDER BY dataset")
                .fetch_all(&self.pool)
                .await?;
        Ok(names)
    }

    async fn reset(&self, dataset: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ingestion_progress WHERE dataset = ?")
            .bind(dataset)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
