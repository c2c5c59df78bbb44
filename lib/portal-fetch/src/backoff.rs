//! Exponential backoff with jitter for fetch retries

use rand::Rng;
use std::cmp::min;
use std::time::Duration;

const MAX_JITTER_MS: u64 = 1_000;

/// Delay before the next attempt: `min(base * 2^(tries-1) + jitter, max)`
/// with up to one second of random jitter.
pub fn retry_delay(tries: u32, base: Duration, max: Duration) -> Duration {
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS));
    retry_delay_with_jitter(tries, base, max, jitter)
}

/// Jitter-injected variant of [`retry_delay`]
pub fn retry_delay_with_jitter(tries: u32, base: Duration, max: Duration, jitter: Duration) -> Duration {
    let exponent = tries.max(1).saturating_sub(1).min(31);
    let deterministic = base.saturating_mul(1u32 << exponent);
    min(deterministic.saturating_add(jitter), max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_component_doubles() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(60);
        let zero = Duration::ZERO;

        assert_eq!(retry_delay_with_jitter(1, base, max, zero), Duration::from_millis(100));
        assert_eq!(retry_delay_with_jitter(2, base, max, zero), Duration::from_millis(200));
        assert_eq!(retry_delay_with_jitter(3, base, max, zero), Duration::from_millis(400));

        let mut previous = Duration::ZERO;
        for tries in 1..40 {
            let delay = retry_delay_with_jitter(tries, base, max, zero);
            assert!(delay >= previous, "deterministic part must not decrease");
            previous = delay;
        }
    }

    #[test]
    fn test_delay_never_exceeds_max() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(5);
        for tries in 1..64 {
            let delay = retry_delay_with_jitter(tries, base, max, Duration::from_millis(999));
            assert!(delay <= max);
        }
    }

    #[test]
    fn test_random_jitter_is_bounded() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(60);
        for _ in 0..100 {
            let delay = retry_delay(1, base, max);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(MAX_JITTER_MS));
        }
    }
}
