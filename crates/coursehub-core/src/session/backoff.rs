//! Readiness-poll backoff.

use std::time::Duration;

pub const INITIAL_DELAY_UNITS: f64 = 1.0;
pub const BACKOFF_FACTOR: f64 = 1.5;
pub const MAX_DELAY_UNITS: f64 = 11.0;

/// Exponential backoff between readiness polls: 1.0 time-unit, growing by
/// 1.5x per iteration, capped at 11.0. Iteration count is unbounded.
#[derive(Debug, Clone)]
pub struct ReadinessBackoff {
    current: f64,
    unit: Duration,
}

impl ReadinessBackoff {
    pub fn new(unit: Duration) -> Self {
        Self {
            current: INITIAL_DELAY_UNITS,
            unit,
        }
    }

    /// Current delay in time-units.
    pub fn current_units(&self) -> f64 {
        self.current
    }

    pub fn delay(&self) -> Duration {
        self.unit.mul_f64(self.current)
    }

    pub fn advance(&mut self) {
        self.current = (self.current * BACKOFF_FACTOR).min(MAX_DELAY_UNITS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_non_decreasing_and_capped() {
        let mut backoff = ReadinessBackoff::new(Duration::from_millis(1));
        let mut previous = 0.0;
        for _ in 0..100 {
            let current = backoff.current_units();
            assert!(current <= MAX_DELAY_UNITS);
            assert!(current >= previous);
            previous = current;
            backoff.advance();
        }
        assert_eq!(backoff.current_units(), MAX_DELAY_UNITS);
    }

    #[test]
    fn test_first_delays() {
        let mut backoff = ReadinessBackoff::new(Duration::from_secs(1));
        assert_eq!(backoff.delay(), Duration::from_secs(1));
        backoff.advance();
        assert_eq!(backoff.delay(), Duration::from_millis(1500));
        backoff.advance();
        assert_eq!(backoff.delay(), Duration::from_millis(2250));
    }
}
