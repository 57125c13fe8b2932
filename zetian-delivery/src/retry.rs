//! Retry backoff with exponential growth and jitter.

use std::time::Duration;

use rand::Rng;

/// `min(base * 2^attempts, cap)` with ±`jitter_factor` applied.
#[must_use]
pub fn backoff_delay(
    attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
) -> Duration {
    let base_secs = base_delay.as_secs();
    let max_secs = max_delay.as_secs();

    let delay = if attempts >= 63 {
        max_secs
    } else {
        base_secs.saturating_mul(1u64 << attempts).min(max_secs)
    };

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let jittered = if jitter_factor > 0.0 {
        let jitter_range = (delay as f64) * jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        ((delay as f64) + jitter).max(0.0) as u64
    } else {
        delay
    };

    Duration::from_secs(jittered)
}
