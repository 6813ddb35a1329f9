//! Bucket hashing and wall-clock helpers for the tracking scheduler.
//!
//! The minute a broadcaster is tracked at is derived from a stable hash of
//! its id, so the assignment survives restarts. Changing the hash function
//! would reshuffle every broadcaster's minute — the constants below are
//! frozen.

use chrono::{DateTime, Timelike, Utc};
use std::time::Duration;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV hash of `key` (multiply, then XOR each byte).
pub fn fnv32(key: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for b in key.as_bytes() {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= u32::from(*b);
    }
    hash
}

/// Map an arbitrary `key` to a bucket in `[0, buckets)` so that keys are
/// evenly distributed across buckets. The same key always lands in the
/// same bucket.
pub fn balanced_bucket(key: &str, buckets: u32) -> u32 {
    fnv32(key) % buckets
}

/// Duration from `now` until the next wall-clock instant whose
/// minute-of-hour equals `minute`.
///
/// Returns zero when `now` is already at that minute; wraps to the next
/// hour when the minute has passed. Seconds within the minute are kept,
/// so the result is always a whole number of minutes.
pub fn until_minute(now: DateTime<Utc>, minute: u32) -> Duration {
    debug_assert!(minute < 60);
    let mut d = i64::from(minute) - i64::from(now.minute());
    if d < 0 {
        d += 60;
    }
    Duration::from_secs(d.unsigned_abs() * 60)
}

/// Truncate `ts` to the start of its hour. Hour is the smallest time unit
/// the storage layer keeps.
pub fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Coefficient of variation of `samples`, as a percentage.
///
/// Pass `sample = false` when the set holds the entire population (the
/// population standard deviation is used), `sample = true` otherwise.
#[allow(clippy::cast_precision_loss)]
pub fn coefficient_of_variation(samples: &[u64], sample: bool) -> f64 {
    let n = samples.len() as f64;
    let total: u64 = samples.iter().sum();
    let mean = total as f64 / n;

    let mut sq_diff = 0.0;
    for s in samples {
        let s = *s as f64;
        sq_diff += (s - mean) * (s - mean);
    }
    let denom = if sample { n - 1.0 } else { n };
    let stddev = (sq_diff / denom).sqrt();

    stddev / mean * 100.0
}
