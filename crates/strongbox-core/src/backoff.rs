//! Backoff schedules shared by the connection supervisor, the endpoint
//! manager, and the lease renewer.
//!
//! Three exponential curves with different bases and caps, plus uniform
//! jitter in `[0, base/4]` so a fleet of agents does not reconnect in
//! lockstep when core recovers.

use std::time::Duration;

use rand::Rng;

/// Largest exponent fed into `1 << n` before we clamp to the cap anyway.
const MAX_SHIFT: u32 = 20;

/// Delay before reconnect attempt `k` (1-based): `min(2^k s, 60 s)`.
#[must_use]
pub fn reconnect_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(MAX_SHIFT);
    Duration::from_secs(secs.min(60))
}

/// Endpoint backoff after the `n`-th failure beyond the failover threshold
/// (1-based): `min(5 · 2^(n−1) s, 300 s)`.
#[must_use]
pub fn endpoint_backoff(n: u32) -> Duration {
    let n = n.max(1);
    let secs = 5u64 << (n - 1).min(MAX_SHIFT);
    Duration::from_secs(secs.min(300))
}

/// Lease renewal retry backoff for retry `k` (1-based):
/// `min(2^(k−1) s, 60 s)`.
#[must_use]
pub fn renewal_backoff(retry: u32) -> Duration {
    let retry = retry.max(1);
    let secs = 1u64 << (retry - 1).min(MAX_SHIFT);
    Duration::from_secs(secs.min(60))
}

/// Add uniform jitter in `[0, base/4]` to a base delay.
#[must_use]
pub fn with_jitter(base: Duration) -> Duration {
    let quarter_ms = u64::try_from((base / 4).as_millis()).unwrap_or(u64::MAX);
    let extra = rand::thread_rng().gen_range(0..=quarter_ms);
    base + Duration::from_millis(extra)
}
