//! SQLite-backed [`Sink`] implementation.
//!
//! Rows live in `target_rows` (see [`crate::migrate`]). `record_ts` is
//! stored as RFC 3339 text with microseconds and a `Z` suffix so that
//! string order matches time order.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};

use backfill_harness_core::models::{DatasetStats, TargetRow};
use backfill_harness_core::sink::{
    ChunkOutcome, KeyColumns, RowFilter, Sink, SinkError, WriteOutcome,
};

/// SQLite implementation of the [`Sink`] trait.
pub struct SqliteSink {
    pool: SqlitePool,
    table: String,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            table: "target_rows".to_string(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Bound usable in a text comparison; open-ended interval ends are `None`.
fn ts_bound(ts: &DateTime<Utc>) -> Option<String> {
    (1..=9999).contains(&ts.year()).then(|| format_ts(ts))
}

/// Map a sqlx error onto the sink taxonomy. Connection-level failures and
/// SQLITE_BUSY / SQLITE_LOCKED (including extended codes) are transient.
pub fn classify(err: sqlx::Error) -> SinkError {
    let transient = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|c| c.parse::<i64>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        _ => false,
    };
    if transient {
        SinkError::Transient(err.to_string())
    } else {
        SinkError::Rejected(err.to_string())
    }
}

async fn upsert_on(
    conn: &mut SqliteConnection,
    dataset: &str,
    row: &TargetRow,
) -> Result<WriteOutcome, sqlx::Error> {
    let ts = format_ts(&row.record_ts);
    let now = Utc::now().timestamp();

    let inserted = sqlx::query(
        r#"
        INSERT INTO target_rows (dataset, natural_key, record_ts, payload_json, payload_hash, ingested_at)
        SELECT ?, ?, ?, ?, ?, ?
        WHERE NOT EXISTS (
            SELECT 1 FROM target_rows WHERE dataset = ? AND natural_key = ?
        )
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(dataset)
    .bind(&row.natural_key)
    .bind(&ts)
    .bind(&row.payload_json)
    .bind(&row.payload_hash)
    .bind(now)
    .bind(dataset)
    .bind(&row.natural_key)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if inserted > 0 {
        return Ok(WriteOutcome::Inserted);
    }

    let merged = sqlx::query(
        r#"
        UPDATE target_rows
        SET record_ts = ?, payload_json = ?, payload_hash = ?, ingested_at = ?
        WHERE dataset = ? AND natural_key = ? AND record_ts < ?
        "#,
    )
    .bind(&ts)
    .bind(&row.payload_json)
    .bind(&row.payload_hash)
    .bind(now)
    .bind(dataset)
    .bind(&row.natural_key)
    .bind(&ts)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(if merged > 0 {
        WriteOutcome::Merged
    } else {
        WriteOutcome::DuplicateIgnored
    })
}

#[async_trait]
impl Sink for SqliteSink {
    fn table(&self) -> &str {
        &self.table
    }

    async fn upsert_or_ignore(
        &self,
        dataset: &str,
        row: &TargetRow,
    ) -> Result<WriteOutcome, SinkError> {
        let mut conn = self.pool.acquire().await.map_err(classify)?;
        upsert_on(&mut conn, dataset, row).await.map_err(classify)
    }

    async fn write_chunk(&self, dataset: &str, rows: &[TargetRow]) -> Result<ChunkOutcome, SinkError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        let mut outcome = ChunkOutcome::default();
        for row in rows {
            outcome.record(upsert_on(&mut tx, dataset, row).await.map_err(classify)?);
        }
        tx.commit().await.map_err(classify)?;
        Ok(outcome)
    }

    async fn count(&self, filter: &RowFilter) -> Result<u64, SinkError> {
        let (start, end) = match &filter.interval {
            Some(iv) => (ts_bound(&iv.start), ts_bound(&iv.end)),
            None => (None, None),
        };
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM target_rows
            WHERE dataset = ?
              AND (? IS NULL OR record_ts >= ?)
              AND (? IS NULL OR record_ts < ?)
            "#,
        )
        .bind(&filter.dataset)
        .bind(&start)
        .bind(&start)
        .bind(&end)
        .bind(&end)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        Ok(count as u64)
    }

    async fn stats(&self, dataset: &str) -> Result<DatasetStats, SinkError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS row_count,
                   COUNT(DISTINCT natural_key) AS distinct_keys,
                   MIN(record_ts) AS first_ts,
                   MAX(record_ts) AS last_ts
            FROM target_rows
            WHERE dataset = ?
            "#,
        )
        .bind(dataset)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        let rows: i64 = row.get("row_count");
        let distinct_keys: i64 = row.get("distinct_keys");
        let first_ts: Option<String> = row.get("first_ts");
        let last_ts: Option<String> = row.get("last_ts");
        Ok(DatasetStats {
            rows: rows as u64,
            distinct_keys: distinct_keys as u64,
            first_ts: first_ts.as_deref().and_then(parse_ts),
            last_ts: last_ts.as_deref().and_then(parse_ts),
        })
    }

    async fn remove_duplicates(&self, key: &KeyColumns) -> Result<u64, SinkError> {
        let sql = format!(
            r#"
            DELETE FROM {table} WHERE id IN (
                SELECT id FROM (
                    SELECT id, ROW_NUMBER() OVER (
                        PARTITION BY {cols}
                        ORDER BY record_ts DESC, id DESC
                    ) AS rn
                    FROM {table}
                ) WHERE rn > 1
            )
            "#,
            table = self.table,
            cols = key.joined()
        );
        let removed = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(classify)?
            .rows_affected();
        Ok(removed)
    }

    async fn execute_ddl(&self, statement: &str) -> Result<(), SinkError> {
        sqlx::query(statement)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
