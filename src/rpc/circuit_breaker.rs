//! Closed/Open/Half-Open breaker shared by every request the client issues.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of breaker internals for observability.
#[derive(Debug, Copy, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub opened_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { since: Instant },
    HalfOpen { in_flight: usize },
}

impl Phase {
    fn state(&self) -> CircuitState {
        match self {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    consecutive_failures: usize,
}

/// Error returned when the breaker refuses to allow an attempt.
#[derive(Debug)]
pub enum CircuitBreakerError {
    CircuitOpen,
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "rpc circuit breaker is open"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

#[derive(Debug, Clone)]
pub struct RpcCircuitBreaker {
    inner: Arc<Mutex<Inner>>,
    failure_threshold: usize,
    cooldown: Duration,
    half_open_sample: usize,
}

impl Default for RpcCircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30), 1)
    }
}

impl RpcCircuitBreaker {
    /// `failure_threshold` consecutive failures open the circuit for `cooldown`;
    /// afterwards up to `half_open_sample` probes decide whether it closes again.
    pub fn new(failure_threshold: usize, cooldown: Duration, half_open_sample: usize) -> Self {
        let cooldown = if cooldown.is_zero() {
            Duration::from_secs(1)
        } else {
            cooldown
        };

        Self {
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Closed,
                consecutive_failures: 0,
            })),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            half_open_sample: half_open_sample.max(1),
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        CircuitBreakerSnapshot {
            state: inner.phase.state(),
            consecutive_failures: inner.consecutive_failures,
            opened_at: match inner.phase {
                Phase::Open { since } => Some(since),
                _ => None,
            },
        }
    }

    /// Asks for permission to send one request, reserving a probe slot while
    /// half-open.
    pub fn before_request(&self) -> Result<CircuitState, CircuitBreakerError> {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");

        if let Phase::Open { since } = inner.phase {
            if since.elapsed() < self.cooldown {
                return Err(CircuitBreakerError::CircuitOpen);
            }
            transition(&mut inner, Phase::HalfOpen { in_flight: 0 });
        }

        if let Phase::HalfOpen { in_flight } = inner.phase {
            if in_flight >= self.half_open_sample {
                return Err(CircuitBreakerError::CircuitOpen);
            }
            inner.phase = Phase::HalfOpen {
                in_flight: in_flight + 1,
            };
        }

        Ok(inner.phase.state())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.consecutive_failures = 0;
        if matches!(inner.phase, Phase::HalfOpen { .. }) {
            transition(&mut inner, Phase::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let trip = match inner.phase {
            Phase::HalfOpen { .. } => true,
            Phase::Closed => inner.consecutive_failures >= self.failure_threshold,
            Phase::Open { .. } => false,
        };
        if trip {
            transition(
                &mut inner,
                Phase::Open {
                    since: Instant::now(),
                },
            );
        }
    }
}

fn transition(inner: &mut Inner, next: Phase) {
    let previous = inner.phase.state();
    inner.phase = next;
    if previous != next.state() {
        tracing::warn!(
            previous = ?previous,
            next = ?next.state(),
            consecutive_failures = inner.consecutive_failures,
            "rpc circuit breaker state changed"
        );
    }
}
