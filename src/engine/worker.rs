use crate::engine::breaker::CircuitBreaker;
use crate::types::{AttemptError, AttemptOutcome, CircuitState, ErrorKind};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

const ADAPTIVE_INITIAL: Duration = Duration::from_millis(50);
const ADAPTIVE_MAX: Duration = Duration::from_secs(5);
const ADAPTIVE_BLOCKED: Duration = Duration::from_secs(1);
const ADAPTIVE_FLOOR: Duration = Duration::from_millis(10);

/// Per-worker pacing that backs off when the target signals rate limiting or blocking.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveDelay {
    current: Duration,
}

impl AdaptiveDelay {
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn observe(&mut self, status: Option<u16>) {
        self.current = match status {
            Some(429) | Some(503) => {
                if self.current.is_zero() {
                    ADAPTIVE_INITIAL
                } else {
                    (self.current * 2).min(ADAPTIVE_MAX)
                }
            }
            Some(403) => self.current.max(ADAPTIVE_BLOCKED),
            _ => {
                let halved = self.current / 2;
                if halved < ADAPTIVE_FLOOR {
                    Duration::ZERO
                } else {
                    halved
                }
            }
        };
    }
}

/// Runs `concurrency` logical workers that each loop on a dispatch function
/// until the deadline passes or the cancel token fires.
pub struct WorkerPool {
    concurrency: u32,
    deadline: Instant,
    breaker: Arc<CircuitBreaker>,
    cancel_token: CancellationToken,
    cooldown: Duration,
    drain_timeout: Duration,
    adaptive_delay: bool,
}

impl WorkerPool {
    pub fn new(
        concurrency: u32,
        deadline: Instant,
        breaker: Arc<CircuitBreaker>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            concurrency: concurrency.max(1),
            deadline,
            breaker,
            cancel_token,
            cooldown: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(9),
            adaptive_delay: false,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// How long in-flight attempts may run past the deadline before being aborted
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_adaptive_delay(mut self, enabled: bool) -> Self {
        self.adaptive_delay = enabled;
        self
    }

    /// Returns once every worker has stopped. No worker runs after this returns.
    pub async fn run<F, Fut>(self, dispatch: F)
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<AttemptOutcome, AttemptError>> + Send + 'static,
    {
        let mut workers = JoinSet::new();

        for id in 0..self.concurrency {
            let worker = Worker {
                id,
                deadline: self.deadline,
                breaker: self.breaker.clone(),
                cancel_token: self.cancel_token.clone(),
                cooldown: self.cooldown,
                adaptive: self.adaptive_delay.then(AdaptiveDelay::default),
            };
            workers.spawn(worker.run(dispatch.clone()));
        }

        tokio::select! {
            _ = sleep_until(self.deadline) => {
                tracing::info!("Duration elapsed, stopping workers");
            }
            _ = self.cancel_token.cancelled() => {
                tracing::info!("Cancellation requested");
            }
            _ = async { while workers.join_next().await.is_some() {} } => {}
        }
        self.cancel_token.cancel();

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = workers.len(),
                "Workers did not finish in time, aborting"
            );
            workers.shutdown().await;
        }
    }
}

struct Worker {
    id: u32,
    deadline: Instant,
    breaker: Arc<CircuitBreaker>,
    cancel_token: CancellationToken,
    cooldown: Duration,
    adaptive: Option<AdaptiveDelay>,
}

impl Worker {
    async fn run<F, Fut>(mut self, dispatch: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<AttemptOutcome, AttemptError>>,
    {
        tracing::debug!("Worker {} started", self.id);

        while !self.should_stop() {
            match dispatch().await {
                Ok(outcome) => match self.adaptive.as_mut() {
                    Some(adaptive) => {
                        adaptive.observe(outcome.status);
                        let delay = adaptive.current();
                        if !delay.is_zero() {
                            self.pause(delay).await;
                        } else {
                            tokio::task::yield_now().await;
                        }
                    }
                    None => tokio::task::yield_now().await,
                },
                Err(err) => {
                    // Rejected outright, or another worker holds the HALF_OPEN trial
                    if err.kind == ErrorKind::CircuitOpen
                        || self.breaker.state() != CircuitState::Closed
                    {
                        self.pause(self.cooldown).await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
            }
        }

        tracing::debug!("Worker {} stopped", self.id);
    }

    fn should_stop(&self) -> bool {
        self.cancel_token.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Sleep that wakes early on cancellation or at the deadline
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = sleep_until(self.deadline) => {}
            _ = self.cancel_token.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::failover::FailoverDispatcher;
    use crate::engine::failover::tests::ScriptedExecutor;
    use crate::engine::stats::RunStats;
    use crate::types::{BreakerConfig, Protocol, ProtocolList};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, open: Duration) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(BreakerConfig {
            threshold,
            open_duration: open,
            half_open_requests: 3,
        }))
    }

    #[test]
    fn test_adaptive_delay_backs_off_and_recovers() {
        let mut d = AdaptiveDelay::default();
        d.observe(Some(429));
        assert_eq!(d.current(), Duration::from_millis(50));
        d.observe(Some(503));
        assert_eq!(d.current(), Duration::from_millis(100));
        for _ in 0..20 {
            d.observe(Some(429));
        }
        assert_eq!(d.current(), Duration::from_secs(5));

        d.observe(Some(200));
        assert_eq!(d.current(), Duration::from_millis(2500));
        for _ in 0..20 {
            d.observe(Some(200));
        }
        assert_eq!(d.current(), Duration::ZERO);
    }

    #[test]
    fn test_adaptive_delay_blocked_floor() {
        let mut d = AdaptiveDelay::default();
        d.observe(Some(403));
        assert_eq!(d.current(), Duration::from_secs(1));
        d.observe(Some(403));
        assert_eq!(d.current(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_stops_at_deadline() {
        let calls = Arc::new(AtomicU32::new(0));
        let cb = breaker(10, Duration::from_secs(1));
        let deadline = Instant::now() + Duration::from_secs(1);
        let pool = WorkerPool::new(4, deadline, cb, CancellationToken::new());

        let counter = calls.clone();
        pool.run(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(100)).await;
                Ok(AttemptOutcome::new(Protocol::Http1, 200, 100_000, 0))
            }
        })
        .await;

        assert!(Instant::now() >= deadline);
        let after = calls.load(Ordering::SeqCst);
        // 4 workers x 10 sequential 100ms attempts within 1s
        assert_eq!(after, 40);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_new_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let cb = breaker(10, Duration::from_secs(1));
        let token = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(60);
        let pool = WorkerPool::new(2, deadline, cb, token.clone());

        let cancel = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            cancel.cancel();
        });

        let counter = calls.clone();
        pool.run(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(100)).await;
                Ok(AttemptOutcome::new(Protocol::Http1, 200, 100_000, 0))
            }
        })
        .await;

        // Attempts started at 0, 100, 200ms; the in-flight one finishes, no new ones start
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(Instant::now() < deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_workers_are_aborted_after_drain_timeout() {
        let cb = breaker(10, Duration::from_secs(1));
        let start = Instant::now();
        let deadline = start + Duration::from_millis(100);
        let pool = WorkerPool::new(3, deadline, cb, CancellationToken::new())
            .with_drain_timeout(Duration::from_millis(500));

        pool.run(|| async {
            sleep(Duration::from_secs(3600)).await;
            Ok(AttemptOutcome::new(Protocol::Http1, 200, 0, 0))
        })
        .await;

        assert!(Instant::now() - start < Duration::from_secs(1));
    }

    /// Always-timing-out target with threshold 3 and a 1s open window.
    #[tokio::test(start_paused = true)]
    async fn test_timeouts_open_circuit_then_single_half_open_probe() {
        let stats = Arc::new(RunStats::new());
        let cb = breaker(3, Duration::from_millis(1000));
        let attempts = Arc::new(std::sync::Mutex::new(Vec::<Instant>::new()));

        struct TimeoutExecutor(Arc<std::sync::Mutex<Vec<Instant>>>);
        impl crate::engine::failover::Executor for TimeoutExecutor {
            async fn attempt(&self, _protocol: Protocol) -> Result<AttemptOutcome, AttemptError> {
                self.0.lock().unwrap().push(Instant::now());
                sleep(Duration::from_millis(50)).await;
                Err(AttemptError::timeout("request timed out"))
            }
        }

        let dispatcher = Arc::new(FailoverDispatcher::new(
            TimeoutExecutor(attempts.clone()),
            ProtocolList::http1_only(),
            cb.clone(),
            stats.clone(),
        ));

        let start = Instant::now();
        let pool = WorkerPool::new(1, start + Duration::from_millis(1600), cb.clone(), CancellationToken::new())
            .with_cooldown(Duration::from_millis(100));

        pool.run(move || {
            let d = dispatcher.clone();
            async move { d.dispatch().await }
        })
        .await;

        let attempts = attempts.lock().unwrap().clone();
        // Three failures trip the breaker at ~150ms
        assert!(attempts.len() >= 3);
        let tripped_at = attempts[2] + Duration::from_millis(50);
        let in_open_window: Vec<_> = attempts
            .iter()
            .filter(|t| **t > attempts[2] && **t < tripped_at + Duration::from_millis(1000))
            .collect();
        assert!(in_open_window.is_empty());

        // Exactly one HALF_OPEN probe, which failed and re-opened the circuit
        assert_eq!(attempts.len(), 4);
        assert!(attempts[3] >= tripped_at + Duration::from_millis(1000));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.trips(), 2);
        assert!(stats.errors().get("CIRCUIT_OPEN").is_some());
        assert_eq!(stats.errors().get("ETIMEDOUT"), Some(&4));
        assert_eq!(stats.successful(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_target_keeps_circuit_closed() {
        let stats = Arc::new(RunStats::new());
        let cb = breaker(3, Duration::from_secs(1));
        let dispatcher = Arc::new(FailoverDispatcher::new(
            ScriptedExecutor::new(vec![]),
            ProtocolList::http1_only(),
            cb.clone(),
            stats.clone(),
        ));
        let pool = WorkerPool::new(10, Instant::now() + Duration::from_secs(1), cb.clone(), CancellationToken::new());

        pool.run(move || {
            let d = dispatcher.clone();
            async move {
                sleep(Duration::from_millis(10)).await;
                d.dispatch().await
            }
        })
        .await;

        assert!(stats.successful() > 0);
        assert_eq!(stats.failed(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_back_off_while_half_open_trial_is_in_flight() {
        let stats = Arc::new(RunStats::new());
        let cb = breaker(1, Duration::from_millis(50));
        let attempts = Arc::new(AtomicU32::new(0));

        // First attempt fails at once, later ones hang for 500ms and then fail
        struct SlowTrialExecutor(Arc<AtomicU32>);
        impl crate::engine::failover::Executor for SlowTrialExecutor {
            async fn attempt(&self, _protocol: Protocol) -> Result<AttemptOutcome, AttemptError> {
                if self.0.fetch_add(1, Ordering::SeqCst) > 0 {
                    sleep(Duration::from_millis(500)).await;
                }
                Err(AttemptError::timeout("request timed out"))
            }
        }

        let dispatcher = Arc::new(FailoverDispatcher::new(
            SlowTrialExecutor(attempts.clone()),
            ProtocolList::http1_only(),
            cb.clone(),
            stats.clone(),
        ));

        let concurrency = 8;
        let window = Duration::from_millis(700);
        let cooldown = Duration::from_millis(100);
        let pool = WorkerPool::new(concurrency, Instant::now() + window, cb.clone(), CancellationToken::new())
            .with_cooldown(cooldown);

        pool.run(move || {
            let d = dispatcher.clone();
            async move { d.dispatch().await }
        })
        .await;

        let rejected = stats.errors().get("CIRCUIT_OPEN").copied().unwrap_or(0);
        let bound = concurrency as u64 * (window.as_millis() / cooldown.as_millis() + 1) as u64;
        assert!(rejected > 0);
        assert!(rejected <= bound, "{} rejections exceeds {}", rejected, bound);
        assert!(attempts.load(Ordering::SeqCst) <= 3);
        assert_eq!(stats.failed(), rejected + stats.errors().get("ETIMEDOUT").copied().unwrap_or(0));
    }
}
