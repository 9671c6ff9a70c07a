//! Exponential backoff generator for reconnect scheduling.
//!
//! Each draw multiplies the running value by `factor` and yields
//! `min(floor(value), max)`. After `steps` draws the generator yields
//! `fallback` forever; a `None` fallback ends the sequence, which the
//! channel treats as "stop reconnecting".

use std::time::Duration;

/// Parameters of a backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Seed value; the first interval is `initial * factor`.
    pub initial: Duration,
    pub factor: f64,
    /// Number of computed intervals before the fallback takes over.
    pub steps: u32,
    /// Ceiling applied to every computed interval.
    pub max: Duration,
    /// Interval returned once steps are exhausted. `None` stops retrying.
    pub fallback: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            factor: 1.5,
            steps: 20,
            max: Duration::from_millis(500),
            fallback: None,
        }
    }
}

impl BackoffConfig {
    /// Start a fresh schedule.
    pub fn start(&self) -> Backoff {
        Backoff {
            value_ms: self.initial.as_millis() as f64,
            factor: self.factor,
            remaining: self.steps,
            max_ms: self.max.as_millis() as u64,
            fallback: self.fallback,
        }
    }
}

/// Stateful backoff cursor. Iterate it to draw successive delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    value_ms: f64,
    factor: f64,
    remaining: u32,
    max_ms: u64,
    fallback: Option<Duration>,
}

impl Backoff {
    /// Draws left before the fallback is reached.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return self.fallback;
        }
        self.remaining -= 1;
        self.value_ms *= self.factor;
        let ms = (self.value_ms.floor() as u64).min(self.max_ms);
        Some(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|v| Duration::from_millis(*v)).collect()
    }

    #[test]
    fn default_schedule() {
        let mut backoff = BackoffConfig::default().start();
        let first: Vec<_> = backoff.by_ref().take(6).collect();
        assert_eq!(first, ms(&[75, 112, 168, 253, 379, 500]));
    }

    #[test]
    fn stops_after_steps_without_fallback() {
        let backoff = BackoffConfig::default().start();
        let draws: Vec<_> = backoff.collect();
        assert_eq!(draws.len(), 20);
        assert!(draws.iter().all(|d| *d <= Duration::from_millis(500)));
    }

    #[test]
    fn fallback_repeats_forever() {
        let config = BackoffConfig {
            initial: Duration::from_millis(50),
            factor: 1.5,
            steps: 2,
            max: Duration::from_millis(500),
            fallback: Some(Duration::from_millis(1000)),
        };
        let draws: Vec<_> = config.start().take(5).collect();
        assert_eq!(draws, ms(&[75, 112, 1000, 1000, 1000]));
    }

    #[test]
    fn zero_steps_goes_straight_to_fallback() {
        let config = BackoffConfig {
            steps: 0,
            ..Default::default()
        };
        assert_eq!(config.start().next(), None);
    }
}
