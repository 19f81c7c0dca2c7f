//! Reconnect backoff for the transport client

use std::time::{Duration, Instant};

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay after a failure
    pub initial_delay: Duration,
    /// Delay ceiling
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Jitter factor to randomize delays
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Exponential backoff between `initial_delay` and `max_delay`
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Same bounds, no randomization
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }
}

/// Exponential backoff state for one connection
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
    next_attempt_at: Option<Instant>,
}

impl Backoff {
    /// Create backoff state that allows an immediate first attempt
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
            next_attempt_at: None,
        }
    }

    /// Consecutive failures since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// True when the next attempt may run now
    pub fn ready(&self) -> bool {
        self.next_attempt_at
            .is_none_or(|at| Instant::now() >= at)
    }

    /// Time left until the next attempt may run
    pub fn remaining(&self) -> Duration {
        self.next_attempt_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Record a failed attempt and schedule the next one
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.delay_for(self.failures);
        self.next_attempt_at = Some(Instant::now() + delay);
        delay
    }

    /// Record a success; the next failure starts from `initial_delay` again
    pub fn reset(&mut self) {
        self.failures = 0;
        self.next_attempt_at = None;
    }

    /// Delay after `attempt` consecutive failures (1-based)
    fn delay_for(&self, attempt: u32) -> Duration {
        let config = &self.config;
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let base = config.initial_delay.as_nanos() as f64 * config.multiplier.powi(exponent);
        let base = base.min(config.max_delay.as_nanos() as f64);

        let jitter_range = base * config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;

        let delay = (base + jitter).clamp(0.0, config.max_delay.as_nanos() as f64);
        Duration::from_nanos(delay as u64)
    }
}
