use super::config::PollerConfig;
use crate::backoff::apply_jitter;
use std::time::Duration;

/// Poll interval that backs off while polls come back empty.
///
/// Doubles after every poll without new data, up to the max; resets to the
/// base as soon as a poll returns something.
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    base: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
}

impl AdaptiveInterval {
    pub fn new(config: &PollerConfig) -> Self {
        let base = config.base_interval();
        Self {
            base,
            max: config.max_interval(),
            jitter: config.jitter.clamp(0.0, 1.0),
            current: base,
        }
    }

    /// Record the outcome of a poll
    pub fn record(&mut self, new_data: bool) {
        self.current = if new_data {
            self.base
        } else {
            self.current.saturating_mul(2).min(self.max)
        };
    }

    /// Interval before jitter
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Sleep before the next poll, jittered
    pub fn next_sleep(&self) -> Duration {
        apply_jitter(self.current, self.jitter)
    }
}
