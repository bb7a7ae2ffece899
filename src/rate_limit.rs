//! Rate-limit accountant: deterministic UTC time windows, applicable-bucket
//! lookup, eligibility evaluation, and post-call consumption.
//!
//! Overshoot under concurrency is accepted: a `read` followed by an
//! `increment` is not atomic here, so two requests landing in the same
//! window can briefly push usage past the configured cap. Rate limits are an
//! advisory scheduling signal, not a hard quota — see the balancer, which
//! treats an exhausted bucket as "deprioritize", not "reject".

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

use crate::config::{BucketConfig, ProviderConfig, WindowUnit};
use crate::state::StateStore;

/// `[startsAt, endsAt)` in UTC milliseconds since epoch, plus the
/// window's stable label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRange {
    pub starts_at_ms: i64,
    pub ends_at_ms: i64,
    pub window_key: String,
}

const ISO_WEEK_ANCHOR_YEAR: i32 = 1970;

fn unit_ms(unit: WindowUnit) -> i64 {
    match unit {
        WindowUnit::Second => 1_000,
        WindowUnit::Minute => 60_000,
        WindowUnit::Hour => 3_600_000,
        WindowUnit::Day => 86_400_000,
        WindowUnit::Week | WindowUnit::Month => unreachable!("handled separately"),
    }
}

/// Resolve the deterministic UTC window containing `now_ms` for the given
/// `(unit, size)`, per spec §4.2.
pub fn resolve_window_range(unit: WindowUnit, size: u32, now_ms: i64) -> WindowRange {
    let size = size.max(1) as i64;
    match unit {
        WindowUnit::Second | WindowUnit::Minute | WindowUnit::Hour | WindowUnit::Day => {
            let span = unit_ms(unit) * size;
            let starts_at = (now_ms.div_euclid(span)) * span;
            let ends_at = starts_at + span;
            let label = match unit {
                WindowUnit::Second => Utc.timestamp_millis_opt(starts_at).unwrap().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                WindowUnit::Minute => Utc.timestamp_millis_opt(starts_at).unwrap().format("%Y-%m-%dT%H:%M:00Z").to_string(),
                WindowUnit::Hour => Utc.timestamp_millis_opt(starts_at).unwrap().format("%Y-%m-%dT%H:00Z").to_string(),
                WindowUnit::Day => Utc.timestamp_millis_opt(starts_at).unwrap().format("%Y-%m-%d").to_string(),
                _ => unreachable!(),
            };
            WindowRange {
                starts_at_ms: starts_at,
                ends_at_ms: ends_at,
                window_key: format!("{}:{}:{}", unit_str(unit), size, label),
            }
        }
        WindowUnit::Week => {
            let anchor = Utc.with_ymd_and_hms(ISO_WEEK_ANCHOR_YEAR, 1, 5, 0, 0, 0).unwrap(); // Monday 1970-01-05
            let now = Utc.timestamp_millis_opt(now_ms).unwrap();
            let days_since_monday = now.weekday().num_days_from_monday() as i64;
            let start_of_iso_week = (now - Duration::days(days_since_monday))
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .unwrap();
            let start_of_iso_week = Utc.from_utc_datetime(&start_of_iso_week);
            let weeks_from_anchor = (start_of_iso_week - anchor).num_weeks();
            let grouped = weeks_from_anchor.div_euclid(size) * size;
            let starts_at = anchor + Duration::weeks(grouped);
            let ends_at = starts_at + Duration::weeks(size);
            WindowRange {
                starts_at_ms: starts_at.timestamp_millis(),
                ends_at_ms: ends_at.timestamp_millis(),
                window_key: format!("week:{}:{}", size, starts_at.format("%Y-%m-%d")),
            }
        }
        WindowUnit::Month => {
            let now = Utc.timestamp_millis_opt(now_ms).unwrap();
            let idx = now.year() as i64 * 12 + (now.month0() as i64);
            let grouped = idx.div_euclid(size) * size;
            let starts_at = month_index_to_utc(grouped);
            let ends_at = month_index_to_utc(grouped + size);
            WindowRange {
                starts_at_ms: starts_at.timestamp_millis(),
                ends_at_ms: ends_at.timestamp_millis(),
                window_key: format!("month:{}:{}", size, starts_at.format("%Y-%m")),
            }
        }
    }
}

fn month_index_to_utc(idx: i64) -> DateTime<Utc> {
    let year = idx.div_euclid(12) as i32;
    let month = (idx.rem_euclid(12) + 1) as u32;
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
}

fn unit_str(unit: WindowUnit) -> &'static str {
    match unit {
        WindowUnit::Second => "second",
        WindowUnit::Minute => "minute",
        WindowUnit::Hour => "hour",
        WindowUnit::Day => "day",
        WindowUnit::Week => "week",
        WindowUnit::Month => "month",
    }
}

pub fn bucket_key(provider_id: &str, bucket_id: &str) -> String {
    format!("bucket:{}:{}", urlencode(provider_id), urlencode(bucket_id))
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// A bucket that applies to a given candidate's model.
#[derive(Debug, Clone)]
pub struct ApplicableBucket<'a> {
    pub bucket: &'a BucketConfig,
    pub bucket_key: String,
    pub window: WindowRange,
}

/// Per spec §4.2: a bucket applies iff it has `requests > 0`, a non-empty
/// model list, and the model list contains `"all"` or the candidate's model
/// id.
pub fn applicable_buckets<'a>(
    provider: &'a ProviderConfig,
    model_id: &str,
    now_ms: i64,
) -> Vec<ApplicableBucket<'a>> {
    provider
        .rate_limits
        .iter()
        .filter(|b| b.requests > 0 && !b.models.is_empty())
        .filter(|b| b.models.iter().any(|m| m == "all" || m == model_id))
        .map(|b| ApplicableBucket {
            bucket: b,
            bucket_key: bucket_key(&provider.id, &b.id),
            window: resolve_window_range(b.window.unit, b.window.size, now_ms),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub eligible: bool,
    pub remaining_capacity_ratio: f64,
}

/// Evaluate eligibility for a candidate's applicable buckets. The candidate
/// is eligible iff no applicable bucket is exhausted;
/// `remainingCapacityRatio` is the minimum remaining-to-capacity ratio across
/// all applicable buckets (1.0 if none apply).
pub async fn evaluate(
    store: &StateStore,
    buckets: &[ApplicableBucket<'_>],
) -> anyhow::Result<Evaluation> {
    let mut min_ratio = 1.0_f64;
    let mut eligible = true;
    for b in buckets {
        let used = store.read_bucket_usage(&b.bucket_key, &b.window.window_key).await?;
        let remaining = (b.bucket.requests as i64 - used as i64).max(0);
        let ratio = remaining as f64 / b.bucket.requests as f64;
        if remaining == 0 {
            eligible = false;
        }
        min_ratio = min_ratio.min(ratio);
    }
    Ok(Evaluation {
        eligible,
        remaining_capacity_ratio: min_ratio,
    })
}

/// Post-call consumption: increment one unit against every applicable bucket.
/// Only called for candidates that were eligible and actually reached the
/// upstream (see spec §4.2).
pub async fn consume(store: &StateStore, buckets: &[ApplicableBucket<'_>]) -> anyhow::Result<()> {
    for b in buckets {
        store
            .increment_bucket_usage(&b.bucket_key, &b.window.window_key, 1, b.window.ends_at_ms)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.from_utc_datetime(&NaiveDate::from_ymd_opt(y, mo, d).unwrap().and_hms_opt(h, mi, s).unwrap())
            .timestamp_millis()
    }

    #[test]
    fn hour_window_key_matches_worked_example() {
        let now = ms(2026, 2, 28, 15, 42, 30);
        let w = resolve_window_range(WindowUnit::Hour, 1, now);
        assert_eq!(w.window_key, "hour:1:2026-02-28T15:00Z");
    }

    #[test]
    fn grouped_hour_window_key_matches_worked_example() {
        let now = ms(2026, 2, 28, 15, 42, 30);
        let w = resolve_window_range(WindowUnit::Hour, 6, now);
        assert_eq!(w.window_key, "hour:6:2026-02-28T12:00Z");
    }

    #[test]
    fn day_window_key_matches_worked_example() {
        let now = ms(2026, 2, 28, 15, 42, 30);
        let w = resolve_window_range(WindowUnit::Day, 1, now);
        assert_eq!(w.window_key, "day:1:2026-02-28");
    }

    #[test]
    fn week_window_key_matches_worked_example() {
        let now = ms(2026, 2, 28, 15, 42, 30);
        let w = resolve_window_range(WindowUnit::Week, 1, now);
        assert_eq!(w.window_key, "week:1:2026-02-23");
    }

    #[test]
    fn month_window_key_matches_worked_example() {
        let now = ms(2026, 2, 28, 15, 42, 30);
        let w = resolve_window_range(WindowUnit::Month, 1, now);
        assert_eq!(w.window_key, "month:1:2026-02");
    }

    #[test]
    fn window_span_matches_unit_times_size() {
        let now = ms(2026, 2, 28, 15, 42, 30);
        let w = resolve_window_range(WindowUnit::Minute, 5, now);
        assert_eq!(w.ends_at_ms - w.starts_at_ms, 5 * 60_000);
    }

    #[test]
    fn window_range_is_stable_across_its_own_span() {
        let now = ms(2026, 2, 28, 15, 42, 30);
        let w = resolve_window_range(WindowUnit::Hour, 1, now);
        let at_start = resolve_window_range(WindowUnit::Hour, 1, w.starts_at_ms);
        let at_end_minus_one = resolve_window_range(WindowUnit::Hour, 1, w.ends_at_ms - 1);
        assert_eq!(w, at_start);
        assert_eq!(w, at_end_minus_one);
    }

    #[test]
    fn month_boundary_rolls_over_year() {
        // Size-2 month groups pair up from the epoch (Jan-Feb, ..., Nov-Dec),
        // so Dec 2026 falls in the Nov-Dec 2026 group, labelled by its start.
        let now = ms(2026, 12, 15, 0, 0, 0);
        let w = resolve_window_range(WindowUnit::Month, 2, now);
        assert_eq!(w.window_key, "month:2:2026-11");
        let next = resolve_window_range(WindowUnit::Month, 2, w.ends_at_ms);
        assert_eq!(next.window_key, "month:2:2027-01");
    }
}
