//! Error and Retry Policy (§4.2, §7): computes backoff with jitter and
//! decides between reschedule and terminal failure.

use crate::config::RetryConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;

/// `delay = min(maxDelayMs, initialDelayMs * multiplier^(attempt-1))` with
/// ±10% jitter, unless the handler supplied an explicit schedule (§4.2).
pub fn backoff_delay_ms(config: &RetryConfig, attempt: i32) -> i64 {
    let exponent = (attempt.max(1) - 1) as i32;
    let raw = config.initial_delay_ms as f64 * config.multiplier.powi(exponent);
    let capped = raw.min(config.max_delay_ms as f64);

    let mut rng = rand::thread_rng();
    let jitter_fraction = rng.gen_range(-0.10..=0.10);
    let jittered = capped * (1.0 + jitter_fraction);
    jittered.max(0.0).round() as i64
}

/// Compute the next `scheduled_at` for a rescheduled attempt.
pub fn next_schedule(config: &RetryConfig, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
    now + ChronoDuration::milliseconds(backoff_delay_ms(config, attempt))
}

/// Jitter a fixed interval by ±10%, used by the worker loop's poll/inner
/// sleeps (§4.4 step 2–3) as well as retry backoff.
pub fn jittered_ms(base_ms: i64) -> i64 {
    let mut rng = rand::thread_rng();
    let jitter_fraction = rng.gen_range(-0.10..=0.10);
    ((base_ms as f64) * (1.0 + jitter_fraction)).max(0.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let config = RetryConfig {
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
        };
        for attempt in 1..10 {
            let delay = backoff_delay_ms(&config, attempt);
            assert!(delay <= 1_100, "attempt {attempt} produced {delay}");
        }
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = 1_000;
        for _ in 0..100 {
            let jittered = jittered_ms(base);
            assert!((900..=1_100).contains(&jittered), "{jittered}");
        }
    }
}
