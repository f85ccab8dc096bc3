//! Circuit breaker for flaky downstream calls.
//!
//! A `Closed -> Open -> HalfOpen -> Closed` state machine over a rolling
//! time window of call outcomes. Handler tasks wrap their downstream
//! calls in [`CircuitBreaker::call`]; while the circuit is open every
//! call short-circuits with [`BreakerError::CircuitOpen`] instead of
//! touching the failing service.
//!
//! Timing uses `tokio::time::Instant` so tests drive transitions with a
//! paused clock instead of sleeping.

pub mod registry;

pub use registry::BreakerRegistry;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; outcomes are recorded.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// A limited probe quota is allowed through to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the `circuit_state` gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// The circuit is open; the downstream was not called.
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// The downstream call itself failed (and was recorded).
    #[error(transparent)]
    Inner(E),
}

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure ratio that trips the circuit.
    pub failure_ratio: f64,
    /// Minimum calls in the window before the ratio is evaluated.
    pub min_samples: usize,
    /// Rolling window over which outcomes are counted.
    pub window: Duration,
    /// How long the circuit stays open before probing.
    pub cool_down: Duration,
    /// Successful probes required to close from half-open.
    pub probe_quota: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            min_samples: 20,
            window: Duration::from_secs(30),
            cool_down: Duration::from_secs(30),
            probe_quota: 3,
        }
    }
}

/// Point-in-time view of a breaker for the admin surface and metrics.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub total_calls: usize,
    pub failure_count: usize,
    pub failure_rate: f64,
}

#[derive(Debug, Clone)]
struct CallRecord {
    at: Instant,
    failed: bool,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    opened_at: Instant,
    records: VecDeque<CallRecord>,
    probes_in_flight: usize,
    probe_successes: usize,
}

impl Inner {
    fn drop_expired(&mut self, window: Duration, now: Instant) {
        while let Some(front) = self.records.front() {
            if now.duration_since(front.at) > window {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }

    fn stats(&self) -> (usize, usize) {
        let total = self.records.len();
        let failures = self.records.iter().filter(|r| r.failed).count();
        (total, failures)
    }

    fn reset_counters(&mut self) {
        self.records.clear();
        self.probes_in_flight = 0;
        self.probe_successes = 0;
    }
}

/// Circuit breaker instance wrapping one named downstream.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: Instant::now(),
                records: VecDeque::new(),
                probes_in_flight: 0,
                probe_successes: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (advancing Open -> HalfOpen if the cool-down is over).
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("lock poisoned");
        self.advance(&mut inner, Instant::now());
        inner.state
    }

    /// Execute `op` under breaker protection.
    pub async fn call<F, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(BreakerError::CircuitOpen(self.name.clone()));
        }

        match op.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Whether a call may proceed right now. Pairs with
    /// [`record_success`](Self::record_success) /
    /// [`record_failure`](Self::record_failure); [`call`](Self::call) does
    /// the pairing for you.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let now = Instant::now();
        self.advance(&mut inner, now);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.probe_quota {
                    inner.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let now = Instant::now();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.probe_quota {
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            _ => {
                inner.records.push_back(CallRecord { at: now, failed: false });
                self.evaluate(&mut inner, now);
            }
        }
    }

    /// Record a failed call outcome.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let now = Instant::now();

        match inner.state {
            // A single failed probe re-opens the circuit.
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, now);
            }
            _ => {
                inner.records.push_back(CallRecord { at: now, failed: true });
                self.evaluate(&mut inner, now);
            }
        }
    }

    /// Manually open the circuit (admin surface).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let now = Instant::now();
        self.transition(&mut inner, CircuitState::Open, now);
    }

    /// Manually close the circuit (admin surface).
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let now = Instant::now();
        self.transition(&mut inner, CircuitState::Closed, now);
    }

    /// Snapshot for the admin surface and the `circuit_state` gauge.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let now = Instant::now();
        self.advance(&mut inner, now);
        inner.drop_expired(self.config.window, now);
        let (total, failures) = inner.stats();

        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            total_calls: total,
            failure_count: failures,
            failure_rate: if total > 0 {
                failures as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn advance(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open
            && now.duration_since(inner.opened_at) >= self.config.cool_down
        {
            self.transition(inner, CircuitState::HalfOpen, now);
        }
    }

    fn evaluate(&self, inner: &mut Inner, now: Instant) {
        if inner.state != CircuitState::Closed {
            return;
        }

        inner.drop_expired(self.config.window, now);
        let (total, failures) = inner.stats();
        if total < self.config.min_samples {
            return;
        }

        let rate = failures as f64 / total as f64;
        if rate >= self.config.failure_ratio {
            warn!(
                breaker = %self.name,
                failure_rate = rate,
                samples = total,
                "Failure ratio exceeded, opening circuit"
            );
            self.transition(inner, CircuitState::Open, now);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        if inner.state == to {
            return;
        }

        info!(breaker = %self.name, from = ?inner.state, to = ?to, "Circuit state transition");
        inner.state = to;

        match to {
            CircuitState::Open => {
                inner.opened_at = now;
                inner.probes_in_flight = 0;
                inner.probe_successes = 0;
            }
            CircuitState::HalfOpen => {
                inner.probes_in_flight = 0;
                inner.probe_successes = 0;
            }
            // Counters reset on close.
            CircuitState::Closed => inner.reset_counters(),
        }
    }
}
