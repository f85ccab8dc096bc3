//! Exponential backoff with full jitter.

use rand::Rng;
use std::time::Duration;

/// Compute the delay before retry number `attempt` (0-based):
/// `min(cap, base * 2^attempt) * rand(0, 1)`.
///
/// Full jitter spreads concurrent retries across the whole interval so a
/// recovering downstream is not hit by a synchronized thundering herd.
pub fn full_jitter_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let ceiling_ms = base_ms.saturating_mul(multiplier).min(cap_ms);

    let jittered_ms = rand::thread_rng().gen_range(0..=ceiling_ms);
    Duration::from_millis(jittered_ms)
}

/// The deterministic ceiling of [`full_jitter_backoff`] for an attempt.
pub fn backoff_ceiling(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;
    let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(multiplier).min(cap_ms))
}
