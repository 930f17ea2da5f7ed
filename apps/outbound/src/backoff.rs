//! Retry backoff: exponential with multiplier 2 and ±20% jitter.

use std::time::Duration;

use rand::Rng;

const JITTER: f64 = 0.2;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// jittered.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
    jittered(Duration::from_secs_f64(exp))
}

/// Applies ±20% jitter; also used for rate-limit requeue delays.
pub fn jittered(base: Duration) -> Duration {
    let mut rng = rand::rng();
    let factor = 1.0 + rng.random_range(-JITTER..=JITTER);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
}
