use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

/// Open a bounded pool to the target database.
///
/// `url` is a sqlx SQLite URL (`sqlite:./data/target.db`); a bare path is
/// accepted too. The file and its parent directory are created on demand.
pub async fn connect_url(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let url = if url.starts_with("sqlite:") {
        url.to_string()
    } else {
        format!("sqlite:{}", url)
    };

    let options = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("invalid database url: {}", url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let db_path = options.get_filename();
    if db_path != Path::new(":memory:") {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to {}", url))?;

    Ok(pool)
}

/// Connect using the configured (or environment-provided) database url.
pub async fn connect(config: &Config, env_url: Option<&str>) -> Result<SqlitePool> {
    let url = config.database_url(env_url)?;
    connect_url(&url, config.db.max_connections).await
}
