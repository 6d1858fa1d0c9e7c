//! Batch planning from a density profile.
//!
//! Months are the default unit. A month with more than `max_rows` rows is
//! split into week slices; a month exactly at `max_rows` is kept whole.
//! Contiguous periods below `min_rows` are merged while the merged estimate
//! stays within `max_rows`. Merges never cross a zero-row gap and never mix
//! whole months with week slices, so the plan covers exactly the nonzero
//! periods of the profile.
//!
//! A date floor that falls inside a period clips that period's batch to
//! start at the floor, so a batch never streams rows the profile excluded.
//!
//! Two cases fall outside `[min_rows, max_rows]`: a run of small periods that
//! cannot reach `min_rows` (isolated months, the tail of a dataset), and a
//! single week slice that alone exceeds `max_rows`.

use anyhow::{bail, Result};
use chrono::NaiveDate;

use crate::distribution::DensityProfile;
use crate::models::{BatchDescriptor, Granularity};
use crate::period;

/// Row budget per batch, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchBudget {
    pub min_rows: u64,
    pub max_rows: u64,
}

impl BatchBudget {
    pub fn new(min_rows: u64, max_rows: u64) -> Result<Self> {
        if max_rows == 0 {
            bail!("max_batch_rows must be > 0");
        }
        if min_rows > max_rows {
            bail!(
                "min_batch_rows ({}) must not exceed max_batch_rows ({})",
                min_rows,
                max_rows
            );
        }
        Ok(Self { min_rows, max_rows })
    }

    pub fn admits(&self, rows: u64) -> bool {
        rows >= self.min_rows && rows <= self.max_rows
    }
}

/// Cut `profile` into ordered, non-overlapping batches.
///
/// An empty profile yields an empty plan.
pub fn plan_batches(profile: &DensityProfile, budget: BatchBudget) -> Vec<BatchDescriptor> {
    let mut plan = Vec::new();
    let mut acc: Option<BatchDescriptor> = None;

    for (&month, &rows) in &profile.monthly {
        if rows == 0 {
            continue;
        }

        if rows > budget.max_rows {
            if let Some(done) = acc.take() {
                plan.push(done);
            }
            split_month(profile, month, budget, &mut plan);
            continue;
        }

        let candidate = BatchDescriptor {
            granularity: Granularity::Month,
            start: clip(month, profile.floor),
            end: period::next_month(month),
            estimated_rows: rows,
        };
        accumulate(&mut acc, candidate, budget, &mut plan);
    }

    if let Some(done) = acc.take() {
        plan.push(done);
    }
    plan
}

fn split_month(
    profile: &DensityProfile,
    month: NaiveDate,
    budget: BatchBudget,
    plan: &mut Vec<BatchDescriptor>,
) {
    let mut acc: Option<BatchDescriptor> = None;
    for (start, rows) in profile.weeks_in_month(month) {
        if rows == 0 {
            continue;
        }
        let candidate = BatchDescriptor {
            granularity: Granularity::Week,
            start: clip(start, profile.floor),
            end: period::week_slice_end(start),
            estimated_rows: rows,
        };
        accumulate(&mut acc, candidate, budget, plan);
    }
    if let Some(done) = acc.take() {
        plan.push(done);
    }
}

fn clip(start: NaiveDate, floor: Option<NaiveDate>) -> NaiveDate {
    floor.map_or(start, |floor| start.max(floor))
}

fn accumulate(
    acc: &mut Option<BatchDescriptor>,
    candidate: BatchDescriptor,
    budget: BatchBudget,
    plan: &mut Vec<BatchDescriptor>,
) {
    match acc.take() {
        Some(mut current)
            if current.end == candidate.start
                && current.estimated_rows < budget.min_rows
                && current.estimated_rows + candidate.estimated_rows <= budget.max_rows =>
        {
            current.end = candidate.end;
            current.estimated_rows += candidate.estimated_rows;
            *acc = Some(current);
        }
        Some(current) => {
            plan.push(current);
            *acc = Some(candidate);
        }
        None => *acc = Some(candidate),
    }
}
