//! Exponential retry backoff.

use std::time::Duration;

/// Default delay before the first retry.
pub const DEFAULT_BASE: Duration = Duration::from_secs(5);

/// Default number of doublings before the delay stops growing.
pub const DEFAULT_MAX_EXPONENT: u32 = 8;

/// Delay before the next attempt after `failures` consecutive failures.
///
/// `base * 2^(failures - 1)`, with the exponent capped at `max_exponent`.
pub fn backoff(failures: u32, base: Duration, max_exponent: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(max_exponent);
    base.saturating_mul(1_u32 << exponent.min(31))
}
