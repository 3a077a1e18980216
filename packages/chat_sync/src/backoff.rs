//! Exponential reconnect backoff with optional jitter.

use std::time::Duration;

use rand::Rng;

/// Upper bound (exclusive) of the random jitter added to each delay.
pub const JITTER_MAX: Duration = Duration::from_millis(1000);

/// Delay before reconnect attempt `attempt` (1-based).
///
/// `min(base * 2^(attempt - 1), max)`, plus a uniform `[0, 1000)` ms when
/// `jitter` is set. Attempt 0 is treated as attempt 1. Never overflows.
pub fn compute_delay(attempt: u32, base: Duration, max: Duration, jitter: bool) -> Duration {
    let delay = exponential(attempt, base, max);
    if jitter {
        delay + random_jitter()
    } else {
        delay
    }
}

fn exponential(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.max(1) - 1;
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

fn random_jitter() -> Duration {
    let millis = rand::rng().random_range(0..JITTER_MAX.as_millis() as u64);
    Duration::from_millis(millis)
}
