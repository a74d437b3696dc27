//! Retry-delay policy (§4.3).
//!
//! Pure functions so the claim-bound property tests in `dataqueue-testing`
//! can exercise the formula without a backend.

use crate::model::RetryPolicy;
use chrono::{DateTime, Duration, Utc};

const LEGACY_BASE_MS: i64 = 60_000;
const DEFAULT_BASE_SECS: i64 = 60;

/// Compute `nextAttemptAt` for a job whose `attempts` (post-increment) is
/// `attempts`, given its retry policy. `now` is the instant of failure.
///
/// `jitter` is a closure returning a uniform sample in `[0.0, 1.0)`; tests
/// supply a deterministic one, production code passes `fastrand::f64`.
pub fn next_attempt_at(
    policy: &RetryPolicy,
    attempts: i32,
    now: DateTime<Utc>,
    jitter: impl FnOnce() -> f64,
) -> DateTime<Utc> {
    now + Duration::milliseconds(delay_ms(policy, attempts, jitter))
}

/// The delay in milliseconds, isolated from `now` for easy bound-testing.
pub fn delay_ms(policy: &RetryPolicy, attempts: i32, jitter: impl FnOnce() -> f64) -> i64 {
    if policy.is_unset() {
        // Legacy formula: 2^attempts minutes, no jitter.
        let exp = 2i64.saturating_pow(attempts.clamp(0, 40) as u32);
        return exp.saturating_mul(LEGACY_BASE_MS);
    }

    let base_secs = policy.retry_delay.unwrap_or(DEFAULT_BASE_SECS).max(0);
    let backoff = policy.retry_backoff.unwrap_or(true);

    if !backoff {
        return base_secs * 1000;
    }

    let exp = 2i64.saturating_pow(attempts.clamp(0, 40) as u32);
    let mut delay_secs = base_secs.saturating_mul(exp);
    if let Some(max) = policy.retry_delay_max {
        delay_secs = delay_secs.min(max.max(0));
    }

    // Full jitter in [delay/2, delay].
    let half = delay_secs as f64 / 2.0;
    let sampled = half + jitter() * half;
    (sampled * 1000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_formula_matches_2_pow_attempts_minutes() {
        for attempts in 0..8 {
            let d = delay_ms(&RetryPolicy::default(), attempts, || 0.0);
            assert_eq!(d, (1i64 << attempts) * 60_000);
        }
    }

    #[test]
    fn fixed_delay_ignores_jitter() {
        let policy = RetryPolicy {
            retry_delay: Some(10),
            retry_backoff: Some(false),
            retry_delay_max: None,
        };
        assert_eq!(delay_ms(&policy, 1, || 0.0), 10_000);
        assert_eq!(delay_ms(&policy, 5, || 0.99), 10_000);
    }

    #[test]
    fn exponential_delay_is_bounded_by_jitter_window() {
        let policy = RetryPolicy {
            retry_delay: Some(10),
            retry_backoff: Some(true),
            retry_delay_max: Some(1000),
        };
        for attempts in 1..10 {
            let lo = delay_ms(&policy, attempts, || 0.0);
            let hi = delay_ms(&policy, attempts, || 0.999_999);
            assert!(lo <= hi, "attempts={attempts} lo={lo} hi={hi}");
            let raw = 10i64 * 2i64.pow(attempts as u32);
            let capped = raw.min(1000);
            assert!(lo as f64 >= (capped as f64 / 2.0) * 1000.0 - 1.0);
            assert!(hi as f64 <= capped as f64 * 1000.0 + 1.0);
        }
    }

    #[test]
    fn default_base_is_sixty_seconds_when_unset() {
        let policy = RetryPolicy {
            retry_delay: None,
            retry_backoff: Some(false),
            retry_delay_max: None,
        };
        assert_eq!(delay_ms(&policy, 1, || 0.0), 60_000);
    }
}
