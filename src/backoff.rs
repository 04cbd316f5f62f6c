use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Configuration for the reconnect backoff schedule
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay for the first retry (milliseconds)
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,

    /// Upper bound for a single delay (milliseconds)
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,

    /// Jitter as a fraction of the delay (0.1 = ±10%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,

    /// Fixed delay while the circuit is open (seconds)
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,
}

fn default_base_ms() -> u64 {
    2_000
}

fn default_cap_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.1
}

fn default_circuit_threshold() -> u32 {
    10
}

fn default_circuit_cooldown_secs() -> u64 {
    120
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
            jitter: default_jitter(),
            circuit_threshold: default_circuit_threshold(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
        }
    }
}

/// Exponential backoff with jitter, cap and circuit breaker.
///
/// Owned by a single writer (the session worker). Delays never decrease
/// between two calls to [`reset`](Self::reset).
#[derive(Debug)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    jitter: f64,
    circuit_threshold: u32,
    cooldown: Duration,

    attempt: u32,
    last_delay: Duration,
    circuit_opened_at: Option<Instant>,
}

impl BackoffPolicy {
    pub fn new(config: &BackoffConfig) -> Self {
        let base = Duration::from_millis(config.base_ms.max(1));
        let cap = Duration::from_millis(config.cap_ms).max(base);
        // Cooldown below the cap would break monotonicity
        let cooldown = Duration::from_secs(config.circuit_cooldown_secs).max(cap);

        Self {
            base,
            cap,
            jitter: config.jitter.clamp(0.0, 1.0),
            circuit_threshold: config.circuit_threshold.max(1),
            cooldown,
            attempt: 0,
            last_delay: Duration::ZERO,
            circuit_opened_at: None,
        }
    }

    /// Delay before the next attempt; records one more failure.
    pub fn next_delay(&mut self) -> Duration {
        if let Some(opened_at) = self.circuit_opened_at {
            if opened_at.elapsed() < self.cooldown {
                return self.cooldown;
            }
            info!("Backoff cooldown elapsed, closing circuit");
            self.reset();
        }

        self.attempt = self.attempt.saturating_add(1);

        if self.attempt >= self.circuit_threshold {
            warn!(
                attempts = self.attempt,
                cooldown_secs = self.cooldown.as_secs(),
                "Retry budget exhausted, opening circuit"
            );
            self.circuit_opened_at = Some(Instant::now());
            self.last_delay = self.cooldown;
            return self.cooldown;
        }

        let delay = self.jittered(self.exponential(self.attempt));
        let delay = delay.min(self.cap).max(self.last_delay);
        self.last_delay = delay;
        delay
    }

    /// Forget all failures and close the circuit
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = Duration::ZERO;
        self.circuit_opened_at = None;
    }

    /// Consecutive failures recorded since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_circuit_open(&self) -> bool {
        match self.circuit_opened_at {
            Some(opened_at) => opened_at.elapsed() < self.cooldown,
            None => false,
        }
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// `base * 2^(n-1)`, saturating at the cap
    fn exponential(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        apply_jitter(delay, self.jitter)
    }
}

/// Scale `delay` by a random factor in `[1 - fraction, 1 + fraction]`
pub(crate) fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - fraction)..=(1.0 + fraction));
    delay.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, cap_ms: u64, jitter: f64) -> BackoffConfig {
        BackoffConfig {
            base_ms,
            cap_ms,
            jitter,
            circuit_threshold: 10,
            circuit_cooldown_secs: 120,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_schedule_without_jitter() {
        let mut policy = BackoffPolicy::new(&config(2_000, 32_000, 0.0));

        let delays: Vec<u64> = (0..5).map(|_| policy.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
        assert_eq!(policy.attempt(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_within_jitter_tolerance() {
        let mut policy = BackoffPolicy::new(&config(2_000, 32_000, 0.1));
        let expected = [2.0, 4.0, 8.0, 16.0, 32.0];

        for want in expected {
            let got = policy.next_delay().as_secs_f64();
            assert!(got >= want * 0.9 - 1e-9, "delay {} for {}", got, want);
            assert!(got <= (want * 1.1).min(32.0) + 1e-9, "delay {} for {}", got, want);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_are_monotonic_and_capped() {
        let mut policy = BackoffPolicy::new(&BackoffConfig {
            circuit_threshold: 50,
            ..config(100, 5_000, 0.3)
        });

        let mut previous = Duration::ZERO;
        for _ in 0..40 {
            let delay = policy.next_delay();
            assert!(delay >= previous, "{:?} < {:?}", delay, previous);
            assert!(delay <= Duration::from_millis(5_000));
            previous = delay;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold() {
        let mut policy = BackoffPolicy::new(&config(1_000, 8_000, 0.0));

        for _ in 0..9 {
            assert!(policy.next_delay() <= Duration::from_secs(8));
        }
        assert!(!policy.is_circuit_open());

        assert_eq!(policy.next_delay(), Duration::from_secs(120));
        assert!(policy.is_circuit_open());

        // Still open: fixed cooldown
        assert_eq!(policy.next_delay(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_closes_after_cooldown() {
        let mut policy = BackoffPolicy::new(&config(1_000, 8_000, 0.0));
        for _ in 0..10 {
            policy.next_delay();
        }
        assert!(policy.is_circuit_open());

        tokio::time::advance(Duration::from_secs(121)).await;

        assert!(!policy.is_circuit_open());
        assert_eq!(policy.next_delay(), Duration::from_secs(1));
        assert_eq!(policy.attempt(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restarts_schedule() {
        let mut policy = BackoffPolicy::new(&config(500, 10_000, 0.0));
        policy.next_delay();
        policy.next_delay();
        policy.next_delay();

        policy.reset();
        assert_eq!(policy.attempt(), 0);
        assert_eq!(policy.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_cooldown_never_below_cap() {
        let policy = BackoffPolicy::new(&BackoffConfig {
            base_ms: 1_000,
            cap_ms: 300_000,
            jitter: 0.0,
            circuit_threshold: 3,
            circuit_cooldown_secs: 10,
        });
        assert_eq!(policy.cooldown, Duration::from_secs(300));
    }
}
