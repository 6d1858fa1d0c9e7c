use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the target and progress tables. Idempotent.
///
/// The `(dataset, natural_key)` index here is non-unique; the unique one
/// is installed by `backfill dedupe --enforce`.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS target_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dataset TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            record_ts TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            payload_hash TEXT NOT NULL,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_progress (
            dataset TEXT NOT NULL,
            batch_key TEXT NOT NULL,
            granularity TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            estimated_rows INTEGER NOT NULL,
            status TEXT NOT NULL,
            processed_rows INTEGER NOT NULL DEFAULT 0,
            total_rows INTEGER NOT NULL DEFAULT 0,
            skipped_rows INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (dataset, batch_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_target_rows_key ON target_rows(dataset, natural_key)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_target_rows_ts ON target_rows(dataset, record_ts)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn run_migrations(config: &Config, env_url: Option<&str>) -> Result<()> {
    let pool = db::connect(config, env_url).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}
