//! RNR (receiver-not-ready) backoff timing (§4.3).
//!
//! The shape mirrors a classic RTO backoff (double on each failure, cap the
//! exponent) but driven by a fixed initial range rather than RFC 6298's
//! SRTT/RTTVAR: there is no round-trip sampling here, only "did the last
//! attempt RNR."

use std::time::Duration;

use rand::Rng;

pub const MIN_INITIAL_TIMEOUT: Duration = Duration::from_micros(40);
pub const MAX_INITIAL_TIMEOUT: Duration = Duration::from_micros(120);
pub const MAX_TIMEOUT: Duration = Duration::from_micros(1_000_000);

/// Picks a randomized initial `timeout_interval` in `[40, 120] μs`, per the
/// peer-record field of the same name.
pub fn random_initial_interval() -> Duration {
    let micros = rand::thread_rng().gen_range(
        MIN_INITIAL_TIMEOUT.as_micros() as u64..=MAX_INITIAL_TIMEOUT.as_micros() as u64,
    );
    Duration::from_micros(micros)
}

/// `backoff = min(max_timeout, timeout_interval * 2^rnr_timeout_exp)`.
pub fn backoff_for(timeout_interval: Duration, rnr_timeout_exp: u32, max_timeout: Duration) -> Duration {
    let shift = rnr_timeout_exp.min(31);
    let scaled = timeout_interval
        .checked_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX))
        .unwrap_or(max_timeout);
    scaled.min(max_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_exponent() {
        let interval = Duration::from_micros(100);
        assert_eq!(backoff_for(interval, 0, MAX_TIMEOUT), Duration::from_micros(100));
        assert_eq!(backoff_for(interval, 1, MAX_TIMEOUT), Duration::from_micros(200));
        assert_eq!(backoff_for(interval, 2, MAX_TIMEOUT), Duration::from_micros(400));
    }

    #[test]
    fn backoff_is_capped_at_max_timeout() {
        let interval = Duration::from_micros(100);
        let backoff = backoff_for(interval, 20, MAX_TIMEOUT);
        assert_eq!(backoff, MAX_TIMEOUT);
    }

    #[test]
    fn random_initial_interval_is_in_bounds() {
        for _ in 0..100 {
            let v = random_initial_interval();
            assert!(v >= MIN_INITIAL_TIMEOUT && v <= MAX_INITIAL_TIMEOUT);
        }
    }
}
