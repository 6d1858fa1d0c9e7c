//! `backfill plan`: analyze a dataset and print the batch plan without
//! touching the target or the progress store.

use anyhow::{Context, Result};

use backfill_harness_core::distribution;
use backfill_harness_core::models::BatchDescriptor;
use backfill_harness_core::monitor::format_number;
use backfill_harness_core::planner;

use crate::config::Config;
use crate::sources::build_source;

pub async fn plan_dataset(config: &Config, name: &str) -> Result<Vec<BatchDescriptor>> {
    let dataset = config.dataset(name)?;
    let source = build_source(dataset);
    let floor = config.date_floor(name)?;
    let budget = config.ingest.budget()?;

    let profile = distribution::analyze(source.as_ref(), floor)
        .await
        .with_context(|| format!("failed to analyze dataset '{}'", name))?;
    if profile.excluded > 0 {
        println!(
            "  note: {} row(s) without a parseable '{}' excluded",
            format_number(profile.excluded),
            dataset.timestamp_field
        );
    }
    if profile.before_floor > 0 {
        println!(
            "  note: {} row(s) before the date floor ignored",
            format_number(profile.before_floor)
        );
    }
    Ok(planner::plan_batches(&profile, budget))
}

pub async fn run_plan(config: &Config, name: &str) -> Result<()> {
    println!("plan {} (dry-run)", name);
    let plan = plan_dataset(config, name).await?;

    if plan.is_empty() {
        println!("  no rows on or after the date floor");
        return Ok(());
    }

    println!();
    println!(
        "  {:<24} {:<12} {:>12}",
        "BATCH", "GRANULARITY", "EST. ROWS"
    );
    for batch in &plan {
        println!(
            "  {:<24} {:<12} {:>12}",
            batch.key(),
            batch.granularity.as_str(),
            format_number(batch.estimated_rows)
        );
    }
    let total: u64 = plan.iter().map(|b| b.estimated_rows).sum();
    println!();
    println!("  batches: {}", plan.len());
    println!("  estimated rows: {}", format_number(total));
    Ok(())
}
