// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Exponential backoff with additive jitter.

use rand::Rng;
use std::time::Duration;

/// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped,
/// plus up to `jitter_ratio` of that delay at random. Jitter only ever adds,
/// so the result is never below the deterministic delay.
pub fn backoff_delay(base: Duration, retry: u32, cap: Duration, jitter_ratio: f64) -> Duration {
    let shift = retry.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << shift).min(cap);
    if jitter_ratio.is_nan() || jitter_ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let extra = delay.mul_f64(jitter_ratio.min(1.0) * rand::thread_rng().gen_range(0.0..=1.0));
    delay + extra
}

/// Longest delay accepted from a server-supplied header. Quotas reset hourly.
pub const MAX_SERVER_DELAY: Duration = Duration::from_secs(60 * 60);

/// Parse a delay header given in seconds, clamped to [`MAX_SERVER_DELAY`].
pub fn header_delay(raw: &str) -> Option<Duration> {
    let secs = raw
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)?;
    Duration::try_from_secs_f64(secs.min(MAX_SERVER_DELAY.as_secs_f64())).ok()
}

/// Parse a `Retry-After` value given in seconds.
pub fn retry_after(raw: Option<&str>) -> Option<Duration> {
    header_delay(raw?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(60);
        let delays: Vec<u64> = (1..=7)
            .map(|n| backoff_delay(base, n, cap, 0.0).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_jitter_only_adds() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let d = backoff_delay(base, 1, Duration::from_secs(1), 0.5);
            assert!(d >= base);
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_retry_after() {
        assert_eq!(retry_after(Some(" 7 ")), Some(Duration::from_secs(7)));
        assert_eq!(retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(retry_after(None), None);
    }

    #[test]
    fn test_oversized_delay_is_clamped() {
        assert_eq!(retry_after(Some("1e20")), Some(MAX_SERVER_DELAY));
        assert_eq!(retry_after(Some("86400")), Some(MAX_SERVER_DELAY));
        assert_eq!(retry_after(Some("NaN")), None);
        assert_eq!(retry_after(Some("inf")), None);
        assert_eq!(retry_after(Some("-3")), None);
    }
}
