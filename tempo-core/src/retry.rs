//! Backoff computation and retry eligibility.

use std::time::Duration;

use rand::Rng;
use tempo_model::{BackoffKind, RetryPolicy};

/// Jitter band applied to exponential backoff.
pub const JITTER_MIN: f64 = 0.8;
pub const JITTER_MAX: f64 = 1.2;

/// Delay before the retry following `retry_index` prior retries
/// (0 for the first retry).
pub fn next_delay(retry_index: u32, policy: &RetryPolicy) -> Duration {
    let jitter = match policy.backoff {
        BackoffKind::ExponentialJitter => {
            rand::rng().random_range(JITTER_MIN..=JITTER_MAX)
        }
        _ => 1.0,
    };
    delay_with_jitter(retry_index, policy, jitter)
}

/// `true` while another attempt is allowed after `attempts_made` attempts.
pub fn should_retry(attempts_made: u32, policy: &RetryPolicy) -> bool {
    attempts_made < policy.max_attempts
}

/// Capped, un-jittered delay for a retry index.
pub fn anchor_delay(retry_index: u32, policy: &RetryPolicy) -> Duration {
    let initial = policy.initial_delay_ms as f64;
    let max = policy.max_delay_ms as f64;
    let raw = match policy.backoff {
        BackoffKind::Fixed => initial,
        BackoffKind::Linear => initial * f64::from(retry_index.saturating_add(1)),
        BackoffKind::ExponentialJitter => {
            let exp = i32::try_from(retry_index).unwrap_or(i32::MAX);
            initial * policy.multiplier.max(1.0).powi(exp)
        }
        BackoffKind::Fibonacci => {
            initial * fibonacci(retry_index.saturating_add(1)) as f64
        }
    };
    let capped = if raw.is_finite() { raw.min(max) } else { max };
    Duration::from_millis(capped.max(0.0).round() as u64)
}

fn delay_with_jitter(
    retry_index: u32,
    policy: &RetryPolicy,
    jitter: f64,
) -> Duration {
    let anchor = anchor_delay(retry_index, policy).as_millis() as f64;
    let jitter = jitter.clamp(JITTER_MIN, JITTER_MAX);
    Duration::from_millis((anchor * jitter).round() as u64)
}

/// 1, 1, 2, 3, 5, ... saturating at `u64::MAX`.
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}
