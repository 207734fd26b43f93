use crate::engine::breaker::CircuitBreaker;
use crate::engine::stats::RunStats;
use crate::types::{AttemptError, AttemptOutcome, Protocol, ProtocolList};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Performs one request attempt over a single protocol.
pub trait Executor: Send + Sync + 'static {
    fn attempt(
        &self,
        protocol: Protocol,
    ) -> impl Future<Output = Result<AttemptOutcome, AttemptError>> + Send;
}

/// Tries each protocol in priority order for one logical request.
///
/// Intermediate failures are fed to the breaker but not counted as run
/// failures; only exhausting the whole list is recorded in [`RunStats`].
pub struct FailoverDispatcher<E> {
    executor: E,
    protocols: ProtocolList,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<RunStats>,
    cancel_token: CancellationToken,
}

impl<E: Executor> FailoverDispatcher<E> {
    pub fn new(
        executor: E,
        protocols: ProtocolList,
        breaker: Arc<CircuitBreaker>,
        stats: Arc<RunStats>,
    ) -> Self {
        Self {
            executor,
            protocols,
            breaker,
            stats,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Stop walking the protocol list once this token fires
    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub async fn dispatch(&self) -> Result<AttemptOutcome, AttemptError> {
        let last = self.protocols.len() - 1;

        for (i, protocol) in self.protocols.iter().enumerate() {
            let result = self
                .breaker
                .execute(|| self.executor.attempt(protocol))
                .await;

            match result {
                Ok(outcome) => {
                    self.stats.record_success(&outcome);
                    return Ok(outcome);
                }
                Err(err) if i == last => {
                    self.stats.record_failure(&err);
                    return Err(err);
                }
                // Cancelled mid-request: no new attempt, and not a run failure
                Err(err) if self.cancel_token.is_cancelled() => return Err(err),
                Err(err) => {
                    tracing::trace!(%protocol, error = %err, "Attempt failed, trying next protocol");
                }
            }
        }

        // ProtocolList is never empty, so the loop always returns
        unreachable!("protocol list exhausted without a result")
    }
}
