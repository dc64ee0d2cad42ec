//! Retry policy and circuit breaker
//!
//! This module provides:
//! - Per-task-kind retry configuration with multiplicative backoff and
//!   jitter
//! - Per-task-kind circuit breaking over a sliding observation window:
//!   Closed -> Open on excessive failure rate, Open -> HalfOpen after the
//!   open timeout, one probe decides between Closed and Open again

use crate::config::{BreakerConfig, RetryConfig};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Computes retry delays per task kind
pub struct RetryPolicy {
    default: RetryConfig,
    per_kind: DashMap<String, RetryConfig>,
}

impl RetryPolicy {
    /// Create a policy with the given default configuration.
    pub fn new(default: RetryConfig) -> Self {
        Self {
            default,
            per_kind: DashMap::new(),
        }
    }

    /// Override the configuration for one task kind.
    pub fn set_kind(&self, kind: impl Into<String>, config: RetryConfig) {
        self.per_kind.insert(kind.into(), config);
    }

    /// Configuration in effect for a kind.
    pub fn config_for(&self, kind: &str) -> RetryConfig {
        self.per_kind
            .get(kind)
            .map(|c| c.clone())
            .unwrap_or_else(|| self.default.clone())
    }

    /// Delay before the next attempt, given `failures` so far.
    ///
    /// The first failure yields the initial delay; each further failure
    /// multiplies it, capped at the maximum. Returns `None` when the kind's
    /// retry budget is exhausted.
    pub fn next_delay(&self, kind: &str, failures: u32) -> Option<Duration> {
        let config = self.config_for(kind);
        if failures == 0 || failures > config.max_retries {
            return None;
        }
        let exponent = (failures - 1).min(31);
        let raw = config.initial_delay_ms as f64 * config.multiplier.powi(exponent as i32);
        let capped = raw.min(config.max_delay_ms as f64);

        let jittered = if config.jitter > 0.0 {
            let spread = capped * config.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };
        Some(Duration::from_millis(jittered as u64))
    }

    /// Maximum retries configured for a kind.
    pub fn max_retries(&self, kind: &str) -> u32 {
        self.config_for(kind).max_retries
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing; execution refused until the open timeout elapses
    Open,
    /// One probe admitted to test recovery
    HalfOpen,
}

struct KindBreaker {
    state: CircuitState,
    /// (when, success) observations inside the sliding window
    observations: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl KindBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            observations: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn prune(&mut self, window: Duration) {
        let Some(cutoff) = Instant::now().checked_sub(window) else {
            return;
        };
        while matches!(self.observations.front(), Some((at, _)) if *at < cutoff) {
            self.observations.pop_front();
        }
    }

    fn failure_rate(&self) -> (f64, usize) {
        let total = self.observations.len();
        if total == 0 {
            return (0.0, 0);
        }
        let failures = self.observations.iter().filter(|(_, ok)| !ok).count();
        (failures as f64 / total as f64, total)
    }
}

/// Per-kind circuit breaker
pub struct CircuitBreaker {
    kinds: DashMap<String, Mutex<KindBreaker>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            kinds: DashMap::new(),
            config,
        }
    }

    fn with_kind<T>(&self, kind: &str, f: impl FnOnce(&mut KindBreaker) -> T) -> T {
        let entry = self
            .kinds
            .entry(kind.to_string())
            .or_insert_with(|| Mutex::new(KindBreaker::new()));
        let mut breaker = entry.lock();
        f(&mut breaker)
    }

    /// Whether an execution of this kind may proceed right now.
    ///
    /// In HalfOpen only a single probe is admitted; everyone else is
    /// refused until the probe reports.
    pub fn allow(&self, kind: &str) -> bool {
        let window = Duration::from_secs(self.config.window_secs);
        let open_timeout = Duration::from_secs(self.config.open_timeout_secs);
        self.with_kind(kind, |breaker| {
            breaker.prune(window);
            match breaker.state {
                CircuitState::Closed => true,
                CircuitState::Open => {
                    let elapsed = breaker
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if elapsed >= open_timeout {
                        breaker.state = CircuitState::HalfOpen;
                        breaker.probe_in_flight = true;
                        log::debug!("circuit for '{kind}' half-open, admitting probe");
                        true
                    } else {
                        false
                    }
                }
                CircuitState::HalfOpen => {
                    if breaker.probe_in_flight {
                        false
                    } else {
                        breaker.probe_in_flight = true;
                        true
                    }
                }
            }
        })
    }

    /// Record a successful execution.
    pub fn record_success(&self, kind: &str) {
        let window = Duration::from_secs(self.config.window_secs);
        self.with_kind(kind, |breaker| {
            breaker.prune(window);
            breaker.observations.push_back((Instant::now(), true));
            if breaker.state == CircuitState::HalfOpen {
                log::info!("circuit for '{kind}' closed after successful probe");
                breaker.state = CircuitState::Closed;
                breaker.probe_in_flight = false;
                breaker.opened_at = None;
                breaker.observations.clear();
            }
        });
    }

    /// Record a failed execution; may open the circuit.
    pub fn record_failure(&self, kind: &str) {
        let window = Duration::from_secs(self.config.window_secs);
        self.with_kind(kind, |breaker| {
            breaker.prune(window);
            breaker.observations.push_back((Instant::now(), false));
            match breaker.state {
                CircuitState::HalfOpen => {
                    log::warn!("circuit for '{kind}' re-opened after failed probe");
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(Instant::now());
                    breaker.probe_in_flight = false;
                }
                CircuitState::Closed => {
                    let (rate, total) = breaker.failure_rate();
                    if total >= self.config.min_observations
                        && rate >= self.config.failure_threshold
                    {
                        log::warn!(
                            "circuit for '{kind}' opened (failure rate {:.0}% over {} observations)",
                            rate * 100.0,
                            total
                        );
                        breaker.state = CircuitState::Open;
                        breaker.opened_at = Some(Instant::now());
                    }
                }
                CircuitState::Open => {}
            }
        });
    }

    /// Current state for a kind (Closed when never observed).
    pub fn state(&self, kind: &str) -> CircuitState {
        self.kinds
            .get(kind)
            .map(|entry| entry.lock().state)
            .unwrap_or(CircuitState::Closed)
    }
}
