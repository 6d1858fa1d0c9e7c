//! Row-density profiling over a source's timestamp field.
//!
//! The profile counts rows per month and per week slice on or after an
//! optional date floor. Rows with missing or unparseable timestamps are
//! counted as `excluded` instead of failing the analysis.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures::StreamExt;

use crate::period;
use crate::source::Source;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DensityProfile {
    pub floor: Option<NaiveDate>,
    /// Row counts keyed by first day of month.
    pub monthly: BTreeMap<NaiveDate, u64>,
    /// Row counts keyed by week-slice start (see [`period::week_slice_start`]).
    pub weekly: BTreeMap<NaiveDate, u64>,
    /// Rows counted into the buckets above.
    pub counted: u64,
    /// Rows whose timestamp was missing or unparseable.
    pub excluded: u64,
    /// Rows dated before the floor.
    pub before_floor: u64,
}

impl DensityProfile {
    pub fn new(floor: Option<NaiveDate>) -> Self {
        Self {
            floor,
            ..Self::default()
        }
    }

    pub fn from_timestamps<I>(timestamps: I, floor: Option<NaiveDate>) -> Self
    where
        I: IntoIterator<Item = Option<DateTime<Utc>>>,
    {
        let mut profile = Self::new(floor);
        for ts in timestamps {
            profile.observe(ts);
        }
        profile
    }

    pub fn observe(&mut self, ts: Option<DateTime<Utc>>) {
        let Some(ts) = ts else {
            self.excluded += 1;
            return;
        };
        let day = ts.date_naive();
        if self.floor.is_some_and(|floor| day < floor) {
            self.before_floor += 1;
            return;
        }
        *self.monthly.entry(period::month_start(day)).or_insert(0) += 1;
        *self.weekly.entry(period::week_slice_start(day)).or_insert(0) += 1;
        self.counted += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.counted == 0
    }

    /// Week slices (start, rows) inside the month beginning at `month`.
    pub fn weeks_in_month(&self, month: NaiveDate) -> impl Iterator<Item = (NaiveDate, u64)> + '_ {
        self.weekly
            .range(month..period::next_month(month))
            .map(|(start, rows)| (*start, *rows))
    }
}

/// Build a density profile by scanning every timestamp in `source`.
pub async fn analyze(source: &dyn Source, floor: Option<NaiveDate>) -> Result<DensityProfile> {
    let mut stamps = source
        .scan_timestamps()
        .await
        .with_context(|| format!("failed to scan timestamps from {}", source.describe()))?;

    let mut profile = DensityProfile::new(floor);
    while let Some(ts) = stamps.next().await {
        profile.observe(ts?);
    }

    tracing::debug!(
        source = %source.describe(),
        counted = profile.counted,
        excluded = profile.excluded,
        before_floor = profile.before_floor,
        months = profile.monthly.len(),
        "density profile built"
    );
    Ok(profile)
}
