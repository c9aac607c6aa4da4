//! Reconnect delays: exponential growth with randomized jitter.
//!
//! Each delay is drawn from `[base/2, base]` where `base` doubles per
//! attempt, then clamped so the sequence never decreases and never exceeds
//! the maximum. [`Backoff::reset`] starts over after a successful connect.

use rand::Rng;
use revssh_core::protocol::{BACKOFF_MAX, BACKOFF_MIN};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
    pub factor: u32,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: BACKOFF_MIN,
            max: BACKOFF_MAX,
            factor: 2,
            jitter: true,
        }
    }
}

/// Stateful reconnect delay generator.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self
            .config
            .min
            .saturating_mul(self.config.factor.saturating_pow(self.attempt))
            .min(self.config.max);
        let base = if self.config.jitter {
            base.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            base
        };

        let delay = base.max(self.last).min(self.config.max);
        self.last = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Sleep for the next delay and return it.
    pub async fn wait(&mut self) -> Duration {
        let delay = self.next_delay();
        debug!(attempt = self.attempt, delay = ?delay, "backing off");
        sleep(delay).await;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_never_decrease_and_cap() {
        let mut backoff = Backoff::default();
        let mut prev = Duration::ZERO;
        for _ in 0..50 {
            let d = backoff.next_delay();
            assert!(d >= prev, "{d:?} < {prev:?}");
            assert!(d <= Duration::from_secs(60));
            prev = d;
        }
        assert!(prev >= Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        for _ in 0..20 {
            let mut backoff = Backoff::default();
            let first = backoff.next_delay();
            assert!(first >= Duration::from_millis(50));
            assert!(first <= Duration::from_millis(100));
        }
    }

    #[test]
    fn without_jitter_doubles() {
        let mut backoff = Backoff::new(BackoffConfig {
            min: Duration::from_millis(10),
            max: Duration::from_millis(100),
            factor: 2,
            jitter: false,
        });
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80),
                Duration::from_millis(100),
                Duration::from_millis(100),
            ]
        );
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter: false,
            ..Default::default()
        });
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 5);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), BACKOFF_MIN);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_for_the_delay() {
        let mut backoff = Backoff::new(BackoffConfig {
            min: Duration::from_secs(1),
            max: Duration::from_secs(4),
            factor: 2,
            jitter: false,
        });
        let start = tokio::time::Instant::now();
        assert_eq!(backoff.wait().await, Duration::from_secs(1));
        assert_eq!(backoff.wait().await, Duration::from_secs(2));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
