//! Progressive reconnect delay.
//!
//! Attempts that fail quickly after the previous one escalate the delay
//! (doubling from `step` up to `max`); a failure long after the previous
//! attempt reconnects immediately and starts over.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub step: Duration,
    pub max: Duration,
    /// Attempts older than this reconnect without delay and reset the fee.
    pub reset_after: Duration,
    /// Attempts younger than this count as quick failures.
    pub quick_failure: Duration,
    /// Total jitter span as a fraction of the delay, centred on it.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(200),
            max: Duration::from_secs(12),
            reset_after: Duration::from_secs(1),
            quick_failure: Duration::from_millis(300),
            jitter: 0.4,
        }
    }
}

pub struct Backoff {
    config: BackoffConfig,
    /// Start of the last attempt.
    marker: Option<Instant>,
    fee: u32,
    limited: bool,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_seed(config: BackoffConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: BackoffConfig, rng: StdRng) -> Self {
        Self {
            config,
            marker: None,
            fee: 0,
            limited: false,
            rng,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.fee = 0;
        self.limited = false;
        self.marker = Some(now);
    }

    /// Record the start of an attempt.
    pub fn mark(&mut self, now: Instant) {
        self.marker = Some(now);
    }

    pub fn fee(&self) -> u32 {
        self.fee
    }

    /// Delay before the next attempt, or `None` to reconnect right away.
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        let since = self
            .marker
            .map(|m| now.saturating_duration_since(m))
            .unwrap_or(Duration::MAX);
        if since >= self.config.reset_after {
            self.reset(now);
            return None;
        }
        if since <= self.config.quick_failure && !self.limited {
            self.fee += 1;
        }
        let base = self.base_delay();
        Some(self.jittered(base))
    }

    fn base_delay(&mut self) -> Duration {
        let factor = 2u32.checked_pow(self.fee).unwrap_or(u32::MAX);
        let delay = self.config.step.saturating_mul(factor);
        if delay >= self.config.max {
            self.limited = true;
            return self.config.max;
        }
        delay
    }

    fn jittered(&mut self, delay: Duration) -> Duration {
        let span = self.config.jitter.clamp(0.0, 1.0);
        let low = delay.mul_f64(1.0 - span / 2.0);
        let extra = delay.mul_f64(span * self.rng.gen::<f64>());
        low + extra
    }
}
