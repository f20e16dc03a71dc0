// src/schedule.rs
//! # Rate Schedule Simulator
//! Decides whether a provider can absorb one more call in the current minute
//! bucket, must wait for a later bucket, or must be deferred to a future
//! Queuer pass.
//!
//! Buckets are UTC minutes keyed as `YYYY-MM-DDTHH:MM`, so lexicographic order
//! of the keys is chronological order. Pure functions; no I/O, no clock reads.

use chrono::{DateTime, Duration, DurationRound, NaiveDateTime, Timelike, Utc};
use std::collections::BTreeMap;

pub const BUCKET_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Calls already scheduled per minute bucket.
pub type CallCounts = BTreeMap<String, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Scheduled; the message should become visible after `delay_secs`.
    Admitted { delay_secs: u64 },
    /// The next free bucket opens `delay_secs` from now, which is beyond what
    /// this pass may schedule.
    Deferred { delay_secs: u64 },
}

/// Where scheduling currently stands for one provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleCursor {
    pub bucket: DateTime<Utc>,
    /// Share of the per-minute limit usable in `bucket` (0, 1].
    pub minute_fraction: f64,
}

impl ScheduleCursor {
    /// Continue in the latest recorded bucket if it still lies ahead of `now`,
    /// otherwise start in the wall-clock minute with a partial budget
    /// proportional to the seconds left in it.
    pub fn resume(counts: &CallCounts, now: DateTime<Utc>) -> Self {
        let current = minute_floor(now);
        match counts.keys().next_back().and_then(|k| parse_bucket(k)) {
            Some(latest) if latest > current => Self {
                bucket: latest,
                minute_fraction: 1.0,
            },
            _ => Self {
                bucket: current,
                minute_fraction: remaining_fraction(now),
            },
        }
    }
}

pub fn admit(
    per_minute: u32,
    counts: &mut CallCounts,
    cursor: &mut ScheduleCursor,
    now: DateTime<Utc>,
    max_delay_secs: u64,
) -> Admission {
    let key = bucket_key(cursor.bucket);
    let used = counts.get(&key).copied().unwrap_or(0);
    if (used as f64) < per_minute as f64 * cursor.minute_fraction {
        counts.insert(key, used + 1);
        return Admission::Admitted {
            delay_secs: delay_until(cursor.bucket, now),
        };
    }

    let next = cursor.bucket + Duration::minutes(1);
    let delay_secs = delay_until(next, now);
    if delay_secs >= max_delay_secs {
        return Admission::Deferred { delay_secs };
    }
    cursor.bucket = next;
    cursor.minute_fraction = 1.0;
    counts.insert(bucket_key(next), 1);
    Admission::Admitted { delay_secs }
}

pub fn bucket_key(t: DateTime<Utc>) -> String {
    t.format(BUCKET_FORMAT).to_string()
}

pub fn parse_bucket(key: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(key, BUCKET_FORMAT)
        .ok()
        .map(|n| n.and_utc())
}

pub fn minute_floor(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::minutes(1)).unwrap_or(t)
}

/// Whole seconds (rounded up) until `bucket` opens; 0 once it is open.
pub fn delay_until(bucket: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let ms = (bucket - now).num_milliseconds();
    if ms <= 0 {
        0
    } else {
        (ms as u64).div_ceil(1000)
    }
}

fn remaining_fraction(now: DateTime<Utc>) -> f64 {
    let elapsed = now.second() as f64 + now.nanosecond().min(999_999_999) as f64 / 1e9;
    ((60.0 - elapsed) / 60.0).clamp(f64::MIN_POSITIVE, 1.0)
}
