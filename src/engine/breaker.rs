//! Run-wide circuit breaker shared by every worker.
//!
//! ```text
//! CLOSED    --(failures >= threshold)-------> OPEN
//! OPEN      --(now >= next_attempt_at)------> HALF_OPEN
//! HALF_OPEN --(half_open_requests successes)> CLOSED
//! HALF_OPEN --(any failure)-----------------> OPEN
//! ```
//!
//! Admission and completion are separate critical sections under one mutex,
//! never held across an `.await`. Every transition bumps `epoch`; completions
//! admitted under an older epoch are discarded.

use crate::types::{AttemptError, BreakerConfig, CircuitState};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    next_attempt_at: Option<Instant>,
    trial_in_flight: bool,
    epoch: u64,
    trips: u64,
}

#[derive(Debug, Clone, Copy)]
struct Ticket {
    epoch: u64,
    trial: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: BreakerConfig {
                threshold: config.threshold.max(1),
                half_open_requests: config.half_open_requests.max(1),
                ..config
            },
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                next_attempt_at: None,
                trial_in_flight: false,
                epoch: 0,
                trips: 0,
            }),
        }
    }

    /// Run `op` if the breaker admits it, and feed its result back into the state machine.
    /// A rejected call returns `CircuitOpen` without invoking `op`.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, AttemptError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let ticket = self.admit().ok_or_else(AttemptError::circuit_open)?;
        let result = op().await;
        match &result {
            Ok(_) => self.on_success(ticket),
            Err(_) => self.on_failure(ticket),
        }
        result
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Number of transitions into OPEN so far
    pub fn trips(&self) -> u64 {
        self.lock().trips
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self) -> Option<Ticket> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(Ticket {
                epoch: inner.epoch,
                trial: false,
            }),
            CircuitState::Open => {
                let ready = inner
                    .next_attempt_at
                    .is_none_or(|at| Instant::now() >= at);
                if !ready {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.successes = 0;
                inner.next_attempt_at = None;
                inner.trial_in_flight = true;
                inner.epoch += 1;
                tracing::info!("Circuit breaker OPEN -> HALF_OPEN");
                Some(Ticket {
                    epoch: inner.epoch,
                    trial: true,
                })
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                Some(Ticket {
                    epoch: inner.epoch,
                    trial: true,
                })
            }
        }
    }

    fn on_success(&self, ticket: Ticket) {
        let mut inner = self.lock();
        if ticket.epoch != inner.epoch {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failures = inner.failures.saturating_sub(1);
            }
            CircuitState::HalfOpen if ticket.trial => {
                inner.trial_in_flight = false;
                inner.successes += 1;
                if inner.successes >= self.config.half_open_requests {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.epoch += 1;
                    tracing::info!("Circuit breaker HALF_OPEN -> CLOSED");
                }
            }
            _ => {}
        }
    }

    fn on_failure(&self, ticket: Ticket) {
        let mut inner = self.lock();
        if ticket.epoch != inner.epoch {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.threshold {
                    self.trip(&mut inner);
                    tracing::info!(
                        failures = inner.failures,
                        "Circuit breaker CLOSED -> OPEN"
                    );
                }
            }
            CircuitState::HalfOpen if ticket.trial => {
                inner.trial_in_flight = false;
                self.trip(&mut inner);
                tracing::info!("Circuit breaker HALF_OPEN -> OPEN");
            }
            _ => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.successes = 0;
        inner.next_attempt_at = Some(Instant::now() + self.config.open_duration);
        inner.epoch += 1;
        inner.trips += 1;
    }
}
