//! Retry backoff computation.
//!
//! Delays grow exponentially with the attempt number, clamp at a configured
//! cap, and are jittered downward so a batch of jobs failing together does
//! not retry together.

use rand::Rng;
use std::time::Duration;

/// Exponential base delay for the retry following `attempt`: `2^(attempt-1)`
/// seconds, clamped to `cap`.
pub fn base_delay(attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(63);
    let secs = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(cap)
}

/// Apply uniform jitter in `[0.5x, 1.0x]` to a base delay.
pub fn with_jitter(base: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.5..=1.0);
    base.mul_f64(factor)
}

/// Jittered delay before the retry that follows failed `attempt`.
pub fn retry_delay(attempt: u32, cap: Duration) -> Duration {
    with_jitter(base_delay(attempt, cap))
}
