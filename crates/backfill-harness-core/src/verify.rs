//! Source-vs-target consistency check.
//!
//! Expected counts are always derived live from the source. Because the
//! target holds one row per natural key (later records merge into earlier
//! ones), the expected row count is the number of distinct valid natural
//! keys on or after the date floor, not the raw record count.
//!
//! Verification never mutates either side; mismatches are reported only.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use futures::StreamExt;
use serde::Serialize;

use crate::models::{DatasetStats, Interval};
use crate::sink::Sink;
use crate::source::Source;
use crate::transform::RecordTransform;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub dataset: String,
    pub expected_rows: u64,
    pub actual_rows: u64,
    /// Source side: `rows` counts raw records on/after the floor,
    /// `distinct_keys` and the date range cover valid records only.
    pub source: DatasetStats,
    /// Records the transform would reject (missing key or required field).
    pub invalid_source_rows: u64,
    pub target: DatasetStats,
    pub consistent: bool,
    /// Human-readable reasons the dataset is inconsistent.
    pub issues: Vec<String>,
}

impl VerificationReport {
    fn evaluate(mut self) -> Self {
        let mut issues = Vec::new();
        if self.actual_rows > self.expected_rows {
            issues.push(format!(
                "target has {} more rows than expected (duplication?)",
                self.actual_rows - self.expected_rows
            ));
        } else if self.actual_rows < self.expected_rows {
            issues.push(format!(
                "target is missing {} rows",
                self.expected_rows - self.actual_rows
            ));
        }
        if self.source.distinct_keys != self.target.distinct_keys {
            issues.push(format!(
                "distinct keys differ: source {} vs target {}",
                self.source.distinct_keys, self.target.distinct_keys
            ));
        }
        self.consistent = issues.is_empty();
        self.issues = issues;
        self
    }
}

/// Compare `dataset` in `sink` against what `source` says it should hold.
pub async fn verify(
    dataset: &str,
    source: &dyn Source,
    sink: &dyn Sink,
    transform: &RecordTransform,
    floor: Option<NaiveDate>,
) -> Result<VerificationReport> {
    let mut stream = source
        .stream(Interval::from_floor(floor))
        .await
        .with_context(|| format!("failed to read source {}", source.describe()))?;

    let mut source_stats = DatasetStats::default();
    let mut keys = HashSet::new();
    let mut invalid = 0u64;

    while let Some(record) = stream.next().await {
        let record = record.with_context(|| format!("failed to read source {}", source.describe()))?;
        source_stats.rows += 1;
        match transform.apply(&record) {
            Ok(row) => {
                keys.insert(row.natural_key);
                let ts = row.record_ts;
                source_stats.first_ts = Some(source_stats.first_ts.map_or(ts, |t| t.min(ts)));
                source_stats.last_ts = Some(source_stats.last_ts.map_or(ts, |t| t.max(ts)));
            }
            Err(_) => invalid += 1,
        }
    }
    source_stats.distinct_keys = keys.len() as u64;

    let target = sink
        .stats(dataset)
        .await
        .with_context(|| format!("failed to read target stats for dataset '{}'", dataset))?;

    let report = VerificationReport {
        dataset: dataset.to_string(),
        expected_rows: source_stats.distinct_keys,
        actual_rows: target.rows,
        source: source_stats,
        invalid_source_rows: invalid,
        target,
        consistent: false,
        issues: Vec::new(),
    }
    .evaluate();

    if report.consistent {
        tracing::info!(dataset, rows = report.actual_rows, "dataset consistent");
    } else {
        tracing::warn!(
            dataset,
            expected = report.expected_rows,
            actual = report.actual_rows,
            issues = ?report.issues,
            "dataset inconsistent"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::memory::InMemorySink;
    use crate::source::MemorySource;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn ts(m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, m, d, 0, 0, 0).unwrap()
    }

    fn source() -> MemorySource {
        let mut src = MemorySource::new();
        for (i, (m, d)) in [(1, 2), (1, 20), (2, 3), (3, 4)].into_iter().enumerate() {
            let fields = json!({"id": i}).as_object().unwrap().clone();
            src.push(Some(ts(m, d)), fields);
        }
        src
    }

    fn transform() -> RecordTransform {
        RecordTransform::new(vec!["id".into()], vec![]).unwrap()
    }

    async fn load(src: &MemorySource, sink: &InMemorySink) {
        let t = transform();
        let mut stream = src.stream(Interval::from_floor(None)).await.unwrap();
        while let Some(r) = stream.next().await {
            sink.upsert_or_ignore("tx", &t.apply(&r.unwrap()).unwrap())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn consistent_after_full_load() {
        let src = source();
        let sink = InMemorySink::new();
        load(&src, &sink).await;

        let report = verify("tx", &src, &sink, &transform(), None).await.unwrap();
        assert!(report.consistent, "{:?}", report.issues);
        assert_eq!(report.expected_rows, 4);
        assert_eq!(report.actual_rows, 4);
        assert_eq!(report.source.first_ts, Some(ts(1, 2)));
        assert_eq!(report.target.last_ts, Some(ts(3, 4)));
    }

    #[tokio::test]
    async fn missing_rows_are_reported() {
        let src = source();
        let sink = InMemorySink::new();
        let report = verify("tx", &src, &sink, &transform(), None).await.unwrap();
        assert!(!report.consistent);
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues[0].contains("missing 4"));
    }

    #[tokio::test]
    async fn duplicates_are_reported_even_when_keys_match() {
        let src = source();
        let sink = InMemorySink::new();
        load(&src, &sink).await;
        let dup = transform()
            .apply(&crate::models::SourceRecord {
                timestamp: ts(1, 2),
                fields: json!({"id": 0}).as_object().unwrap().clone(),
            })
            .unwrap();
        sink.insert_unchecked("tx", dup).unwrap();

        let report = verify("tx", &src, &sink, &transform(), None).await.unwrap();
        assert!(!report.consistent);
        assert_eq!(report.actual_rows, 5);
        assert_eq!(report.target.distinct_keys, 4);
        assert_eq!(report.issues.len(), 1);
    }

    #[tokio::test]
    async fn floor_and_invalid_records_shape_expectation() {
        let mut src = source();
        src.push(Some(ts(3, 9)), json!({"no_id": 1}).as_object().unwrap().clone());
        let sink = InMemorySink::new();
        let floor = NaiveDate::from_ymd_opt(2024, 2, 1);

        let report = verify("tx", &src, &sink, &transform(), floor).await.unwrap();
        assert_eq!(report.source.rows, 3);
        assert_eq!(report.invalid_source_rows, 1);
        assert_eq!(report.expected_rows, 2);
    }
}
