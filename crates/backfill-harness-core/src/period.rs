//! Calendar period arithmetic and timestamp parsing.
//!
//! Week buckets are ISO weeks (Monday start) clipped to their calendar
//! month, so every week slice nests inside exactly one month.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

/// Midnight UTC at the start of `date`.
pub fn date_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.day0() as i64)
}

/// First day of the month after `date`'s month.
pub fn next_month(date: NaiveDate) -> NaiveDate {
    month_start(month_start(date) + Duration::days(32))
}

fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Start of the week slice containing `date`.
pub fn week_slice_start(date: NaiveDate) -> NaiveDate {
    monday_of(date).max(month_start(date))
}

/// Exclusive end of the week slice starting at `start`.
pub fn week_slice_end(start: NaiveDate) -> NaiveDate {
    (monday_of(start) + Duration::days(7)).min(next_month(start))
}

/// Parse a source timestamp.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]`, `YYYY-MM-DDTHH:MM:SS[.f]`
/// (naive values are taken as UTC), bare dates, and integer Unix epochs in
/// seconds or milliseconds. Returns `None` for anything else.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date_start(date));
    }

    if let Ok(epoch) = raw.parse::<i64>() {
        return parse_epoch(epoch);
    }

    None
}

/// Interpret an integer epoch; values past year 5138 in seconds are millis.
pub fn parse_epoch(epoch: i64) -> Option<DateTime<Utc>> {
    if epoch.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(epoch).single()
    } else {
        Utc.timestamp_opt(epoch, 0).single()
    }
}
