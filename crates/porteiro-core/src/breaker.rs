//! Circuit breaker for external calls (gateway send, classifier).
//!
//! Closed → Open after `failure_threshold` consecutive failures;
//! Open → HalfOpen once `recovery_timeout` has elapsed; a success in
//! HalfOpen closes the circuit, a failure reopens it immediately.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Returned when a call is rejected because the circuit is open.
#[derive(Debug, Error)]
#[error("circuit breaker '{name}' is open, retry in {retry_in_ms}ms")]
pub struct BreakerOpen {
    pub name: &'static str,
    pub retry_in_ms: u64,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    state_changed_at: Instant,
    opened_count: u64,
}

pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                state_changed_at: Instant::now(),
                opened_count: 0,
            }),
        }
    }

    /// Gate a call. `Ok(())` means the caller may proceed and must report the
    /// outcome via [`on_success`](Self::on_success) / [`on_failure`](Self::on_failure).
    pub fn try_acquire(&self) -> std::result::Result<(), BreakerOpen> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.state_changed_at.elapsed();
                if elapsed >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.state_changed_at = Instant::now();
                    tracing::info!(breaker = self.name, "circuit breaker attempting recovery");
                    Ok(())
                } else {
                    let retry_in = self.recovery_timeout - elapsed;
                    Err(BreakerOpen {
                        name: self.name,
                        retry_in_ms: retry_in.as_millis() as u64,
                    })
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.state_changed_at = Instant::now();
            tracing::info!(breaker = self.name, "circuit breaker closed after recovery");
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.state_changed_at = Instant::now();
                inner.opened_count += 1;
                tracing::error!(breaker = self.name, "circuit breaker reopened after recovery failure");
            }
            BreakerState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.state = BreakerState::Open;
                inner.state_changed_at = Instant::now();
                inner.opened_count += 1;
                tracing::error!(
                    breaker = self.name,
                    failures = inner.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn opened_count(&self) -> u64 {
        self.inner.lock().unwrap().opened_count
    }
}
