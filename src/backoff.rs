/// Capped exponential backoff for remote reconnection.
///
/// Each call to `next_delay()` returns the current delay and multiplies it
/// for the next attempt, never exceeding `max_delay`. `reset()` goes back to
/// `initial_delay` once a session is re-established.
use std::time::Duration;

use crate::config::ReconnectionConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    current_delay: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            // a multiplier below 1 would shrink the delay
            multiplier: multiplier.max(1.0),
            current_delay: initial_delay.min(max_delay),
            attempt: 0,
        }
    }

    pub fn from_config(config: &ReconnectionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_multiplier,
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = self.current_delay.mul_f64(self.multiplier).min(self.max_delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay.min(self.max_delay);
        self.attempt = 0;
    }

    /// Consecutive attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn exceeded_max_attempts(&self, max: u32) -> bool {
        self.attempt >= max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_default_reconnection_schedule() {
        let mut b = Backoff::from_config(&ReconnectionConfig::default());
        let delays: Vec<_> = (0..7).map(|_| b.next_delay()).collect();
        assert_eq!(
            delays,
            vec![ms(1_000), ms(2_000), ms(4_000), ms(8_000), ms(16_000), ms(30_000), ms(30_000)]
        );
    }

    #[test]
    fn test_fractional_multiplier() {
        let mut b = Backoff::new(ms(1_000), ms(10_000), 1.5);
        assert_eq!(b.next_delay(), ms(1_000));
        assert_eq!(b.next_delay(), ms(1_500));
        assert_eq!(b.next_delay(), ms(2_250));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut b = Backoff::new(ms(100), ms(1_000), 2.0);
        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempt(), 2);

        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next_delay(), ms(100));
    }

    #[test]
    fn test_exceeded_max_attempts() {
        let mut b = Backoff::new(ms(1), ms(10), 2.0);
        for _ in 0..2 {
            b.next_delay();
            assert!(!b.exceeded_max_attempts(3));
        }
        b.next_delay();
        assert!(b.exceeded_max_attempts(3));
    }

    #[test]
    fn test_initial_delay_above_cap_is_clamped() {
        let mut b = Backoff::new(ms(5_000), ms(1_000), 2.0);
        assert_eq!(b.next_delay(), ms(1_000));
    }

    #[test]
    fn test_multiplier_below_one_never_shrinks() {
        let mut b = Backoff::new(ms(400), ms(1_000), 0.5);
        assert_eq!(b.next_delay(), ms(400));
        assert_eq!(b.next_delay(), ms(400));
    }
}
