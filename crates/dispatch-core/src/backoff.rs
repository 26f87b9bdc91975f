//! Retry backoff policy.
//!
//! Delay before attempt `n` (1-indexed) is `BACKOFF_BASE_MS * 2^(n-1)`, capped
//! at `BACKOFF_CAP_MS`. No jitter is applied.

use std::time::Duration;

/// Delay before the first retry.
pub const BACKOFF_BASE_MS: u64 = 5_000;

/// Upper bound for any single delay.
pub const BACKOFF_CAP_MS: u64 = 60_000;

/// Backoff in milliseconds for a 1-indexed attempt number.
///
/// Attempt 0 has no delay.
pub fn compute_backoff_ms(attempt: u32) -> u64 {
    backoff_ms(attempt, BACKOFF_BASE_MS, BACKOFF_CAP_MS)
}

/// Backoff for a 1-indexed attempt number as a chrono duration, for
/// computing `next_attempt_at`.
pub fn compute_backoff(attempt: u32) -> chrono::Duration {
    chrono::Duration::milliseconds(compute_backoff_ms(attempt) as i64)
}

/// Backoff as a std duration, for arming timers.
pub fn compute_backoff_duration(attempt: u32) -> Duration {
    Duration::from_millis(compute_backoff_ms(attempt))
}

fn backoff_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }

    let shift = attempt - 1;
    let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    base_ms.saturating_mul(multiplier).min(cap_ms)
}
