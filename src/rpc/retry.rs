//! Logging context threaded through `retry_with_breaker` so every attempt of a
//! call reports the method and, when relevant, the height it was for.

use crate::rpc::circuit_breaker::CircuitState;
use anyhow::Error;
use std::time::Duration;

macro_rules! log_with_retry_ctx {
    ($level:ident, $ctx:expr, $($rest:tt)*) => {{
        if let Some(height) = $ctx.height {
            tracing::$level!(method = $ctx.method, height, $($rest)*);
        } else {
            tracing::$level!(method = $ctx.method, $($rest)*);
        }
    }};
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryContext {
    method: &'static str,
    height: Option<u64>,
}

impl RetryContext {
    pub(crate) fn new(method: &'static str) -> Self {
        Self {
            method,
            height: None,
        }
    }

    pub(crate) fn at_height(method: &'static str, height: u64) -> Self {
        Self {
            method,
            height: Some(height),
        }
    }

    pub(crate) fn method(&self) -> &'static str {
        self.method
    }

    pub(crate) fn height(&self) -> Option<u64> {
        self.height
    }

    pub(crate) fn log_permit(&self, state: CircuitState) {
        log_with_retry_ctx!(trace, self, breaker_state = ?state, "circuit breaker permit acquired");
    }

    pub(crate) fn log_circuit_open(&self) {
        log_with_retry_ctx!(warn, self, "rpc circuit breaker open; rejecting request");
    }

    pub(crate) fn log_unavailable(&self, attempt: usize, height: u64) {
        log_with_retry_ctx!(
            debug,
            self,
            attempt,
            requested_height = height,
            "node has not reached the requested height yet"
        );
    }

    pub(crate) fn log_retry(&self, attempt: usize, backoff: Duration, err: &Error, timeout: bool) {
        log_with_retry_ctx!(
            warn,
            self,
            attempt,
            backoff_ms = duration_to_millis(backoff),
            timeout,
            error = %err,
            "rpc call failed; retrying"
        );
    }

    pub(crate) fn log_exhausted(&self, attempt: usize, err: &Error) {
        log_with_retry_ctx!(error, self, attempt, error = %err, "rpc call exhausted retries");
    }

    pub(crate) fn log_oversized(&self, attempt: usize) {
        log_with_retry_ctx!(
            warn,
            self,
            attempt,
            "rpc response exceeded the HTTP size limit; not retrying"
        );
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Exponential backoff starting at `initial`, doubling per attempt, capped at `max`.
pub(crate) fn backoff_delay(attempt: usize, initial: Duration, max: Duration) -> Duration {
    if attempt <= 1 {
        return initial.min(max.max(initial));
    }

    let exponent = attempt.saturating_sub(1) as u32;
    let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    initial.saturating_mul(multiplier).min(max.max(initial))
}
