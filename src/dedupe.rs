//! `backfill dedupe`: collapse duplicate natural keys in the target table
//! and optionally install the unique index.

use anyhow::Result;

use backfill_harness_core::dedupe;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::sink_sqlite::SqliteSink;

pub async fn run_dedupe(config: &Config, env_url: Option<&str>, enforce: bool) -> Result<()> {
    let key = config.dedupe.key()?;
    let pool = db::connect(config, env_url).await?;
    migrate::migrate(&pool).await?;
    let sink = SqliteSink::new(pool.clone());

    let report = dedupe::run(&sink, &key, enforce).await;
    pool.close().await;
    let report = report?;

    println!("dedupe {} ({})", report.table, report.key_columns.join(", "));
    println!("  duplicates removed: {}", report.removed);
    match &report.index {
        Some(ddl) => println!("  enforced: {}", ddl),
        None => println!("  unique index not enforced (pass --enforce)"),
    }
    println!("ok");
    Ok(())
}
