//! Capped exponential backoff with positive jitter.

use std::time::Duration;

use cardpipe_shared::PipelineConfig;

/// Fraction of the raw delay added as jitter, at most.
const JITTER_FRACTION: f64 = 0.1;

/// Backoff envelope: `min(base * factor^attempt, max)` plus up to 10% jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        Self { base, max, factor }
    }

    /// No waiting at all. Used by tests and dry runs.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// The unjittered delay for a zero-based attempt index.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base.as_secs_f64() * self.factor.powi(exponent);
        let capped = raw.min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max)
    }

    /// Delay with a caller-supplied jitter sample in `[0, 1)`.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let raw = self.raw_delay(attempt);
        let unit = if unit.is_finite() { unit.clamp(0.0, 1.0) } else { 0.0 };
        raw.saturating_add(raw.mul_f64(JITTER_FRACTION * unit))
    }

    /// Delay with a fresh random jitter sample.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, rand::random::<f64>())
    }
}

impl From<&PipelineConfig> for Backoff {
    fn from(config: &PipelineConfig) -> Self {
        Self::new(config.base_delay, config.max_delay, config.backoff_factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }

    #[test]
    fn raw_delay_doubles_then_caps() {
        let b = envelope();
        assert_eq!(b.raw_delay(0), Duration::from_secs(1));
        assert_eq!(b.raw_delay(1), Duration::from_secs(2));
        assert_eq!(b.raw_delay(5), Duration::from_secs(32));
        assert_eq!(b.raw_delay(6), Duration::from_secs(60));
        assert_eq!(b.raw_delay(40), Duration::from_secs(60));
        assert_eq!(b.raw_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn envelope_is_non_decreasing() {
        let b = envelope();
        for unit in [0.0, 0.25, 0.999] {
            let delays: Vec<_> = (0..12).map(|n| b.delay_with_jitter(n, unit)).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
        }
    }

    #[test]
    fn jitter_is_positive_and_bounded() {
        let b = envelope();
        for n in 0..10 {
            let raw = b.raw_delay(n);
            for _ in 0..50 {
                let d = b.delay(n);
                assert!(d >= raw);
                assert!(d <= raw + raw.mul_f64(JITTER_FRACTION));
            }
        }
    }

    #[test]
    fn bad_jitter_samples_are_clamped() {
        let b = envelope();
        assert_eq!(b.delay_with_jitter(0, -3.0), Duration::from_secs(1));
        assert_eq!(b.delay_with_jitter(0, f64::NAN), Duration::from_secs(1));
        assert_eq!(b.delay_with_jitter(0, 7.0), Duration::from_millis(1100));
    }

    #[test]
    fn huge_envelope_saturates() {
        let b = Backoff::new(Duration::MAX, Duration::MAX, 2.0);
        assert_eq!(b.raw_delay(3), Duration::MAX);
        assert_eq!(b.delay_with_jitter(3, 0.9), Duration::MAX);
        assert_eq!(b.delay(0), Duration::MAX);
    }

    #[test]
    fn none_never_waits() {
        let b = Backoff::none();
        assert_eq!(b.delay(0), Duration::ZERO);
        assert_eq!(b.delay(9), Duration::ZERO);
    }
}
