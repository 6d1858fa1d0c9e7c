//! `backfill verify`: compare each dataset's source with the target.

use anyhow::{bail, Result};

use backfill_harness_core::monitor::format_number;
use backfill_harness_core::verify::{self, VerificationReport};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::sink_sqlite::SqliteSink;
use crate::sources::{build_source, build_transform};

fn print_report(report: &VerificationReport) {
    println!("verify {}", report.dataset);
    println!("  expected rows: {}", format_number(report.expected_rows));
    println!("  actual rows:   {}", format_number(report.actual_rows));
    println!(
        "  distinct keys: source {} / target {}",
        format_number(report.source.distinct_keys),
        format_number(report.target.distinct_keys)
    );
    if report.invalid_source_rows > 0 {
        println!(
            "  invalid source rows (skipped at ingest): {}",
            format_number(report.invalid_source_rows)
        );
    }
    let range = |first: Option<chrono::DateTime<chrono::Utc>>,
                 last: Option<chrono::DateTime<chrono::Utc>>| match (first, last) {
        (Some(a), Some(b)) => format!("{} .. {}", a.to_rfc3339(), b.to_rfc3339()),
        _ => "-".to_string(),
    };
    println!(
        "  source range:  {}",
        range(report.source.first_ts, report.source.last_ts)
    );
    println!(
        "  target range:  {}",
        range(report.target.first_ts, report.target.last_ts)
    );
    if report.consistent {
        println!("  consistent");
    } else {
        for issue in &report.issues {
            println!("  INCONSISTENT: {}", issue);
        }
    }
}

pub async fn run_verify(
    config: &Config,
    env_url: Option<&str>,
    selector: &str,
    json: bool,
) -> Result<()> {
    let names = config.select_datasets(selector)?;
    let pool = db::connect(config, env_url).await?;
    migrate::migrate(&pool).await?;
    let sink = SqliteSink::new(pool.clone());

    let mut reports = Vec::with_capacity(names.len());
    for name in &names {
        let dataset = config.dataset(name)?;
        let source = build_source(dataset);
        let transform = build_transform(dataset)?;
        let floor = config.date_floor(name)?;
        let report = verify::verify(name, source.as_ref(), &sink, &transform, floor).await?;
        if !report.consistent {
            tracing::error!(dataset = %name, issues = ?report.issues, "dataset is inconsistent");
        }
        reports.push(report);
    }
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for (i, report) in reports.iter().enumerate() {
            if i > 0 {
                println!();
            }
            print_report(report);
        }
    }

    let inconsistent = reports.iter().filter(|r| !r.consistent).count();
    if inconsistent > 0 {
        bail!("{} dataset(s) failed verification", inconsistent);
    }
    Ok(())
}
