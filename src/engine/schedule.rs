//! Iteration schedule helpers.
//!
//! A cycle's duration maps to the closest configured bucket, each with a
//! fixed iteration interval. The resulting count is clamped to 6..=24 and
//! the last due-time always equals `start + duration`.

use chrono::{DateTime, Duration, Utc};

use crate::types::Cycle;

pub const MIN_ITERATIONS: usize = 6;
pub const MAX_ITERATIONS: usize = 24;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;

/// (cycle duration, iteration interval), in milliseconds.
const BUCKETS: &[(i64, i64)] = &[
    (HOUR_MS, 10 * MINUTE_MS),
    (2 * HOUR_MS, 10 * MINUTE_MS),
    (3 * HOUR_MS, 15 * MINUTE_MS),
    (6 * HOUR_MS, 30 * MINUTE_MS),
    (12 * HOUR_MS, HOUR_MS),
    (24 * HOUR_MS, 2 * HOUR_MS),
    (48 * HOUR_MS, 4 * HOUR_MS),
    (72 * HOUR_MS, 6 * HOUR_MS),
    (7 * 24 * HOUR_MS, 12 * HOUR_MS),
];

/// Interval of the bucket closest to `duration_ms`. Ties go to the shorter bucket.
pub fn get_iteration_interval(duration_ms: i64) -> i64 {
    BUCKETS
        .iter()
        .min_by_key(|(bucket, _)| (bucket - duration_ms).abs())
        .map(|(_, interval)| *interval)
        .unwrap_or(HOUR_MS)
}

fn raw_count(duration_ms: i64) -> i64 {
    let interval = get_iteration_interval(duration_ms);
    if duration_ms <= 0 {
        return 0;
    }
    (duration_ms + interval - 1) / interval
}

pub fn get_iteration_count(duration_ms: i64) -> usize {
    let clamped = raw_count(duration_ms).clamp(MIN_ITERATIONS as i64, MAX_ITERATIONS as i64);
    clamped as usize
}

/// Absolute due-times for every iteration of a cycle.
pub fn get_iteration_schedule(start: DateTime<Utc>, duration_ms: i64) -> Vec<DateTime<Utc>> {
    let count = get_iteration_count(duration_ms);
    let raw = raw_count(duration_ms);
    let step_ms = if raw == count as i64 {
        get_iteration_interval(duration_ms)
    } else {
        duration_ms.max(0) / count as i64
    };

    let end = start + Duration::milliseconds(duration_ms.max(0));
    let mut schedule: Vec<DateTime<Utc>> = (1..=count as i64)
        .map(|i| (start + Duration::milliseconds(step_ms * i)).min(end))
        .collect();
    if let Some(last) = schedule.last_mut() {
        *last = end;
    }
    schedule
}

pub fn total_iterations(cycle: &Cycle) -> usize {
    get_iteration_count(cycle.duration_ms)
}

/// Whether the next iteration of `cycle` is due at `now`.
pub fn has_iteration_due(cycle: &Cycle, now: DateTime<Utc>) -> bool {
    get_next_iteration_time(cycle).is_some_and(|due| now >= due)
}

/// Due-time of the next unrecorded iteration, or `None` once the cycle is done.
pub fn get_next_iteration_time(cycle: &Cycle) -> Option<DateTime<Utc>> {
    if cycle.is_completed() {
        return None;
    }
    get_iteration_schedule(cycle.start_time, cycle.duration_ms)
        .get(cycle.iterations.len())
        .copied()
}
