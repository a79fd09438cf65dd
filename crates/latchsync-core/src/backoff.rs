// ── Backoff calculation ──

use std::time::Duration;

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) * (1 +- 0.25)`
///
/// The jitter is derived from the attempt number, so the schedule is
/// reproducible while still spreading out retries from many clients that
/// reconnect at the same moment.
pub fn exponential_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
    let base = initial.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(max.as_secs_f64());

    let jitter_factor = 0.25_f64.mul_add((f64::from(attempt) * 7.3).sin(), 1.0);
    let with_jitter = (capped * jitter_factor).max(0.0);

    // Jitter can push a delay near `Duration::MAX` past what fits.
    Duration::try_from_secs_f64(with_jitter).unwrap_or(max)
}
