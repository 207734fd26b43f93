use crate::engine::attack::AttackDriver;
use crate::engine::breaker::CircuitBreaker;
use crate::engine::failover::FailoverDispatcher;
use crate::engine::reporter::Reporter;
use crate::engine::snapshot::{StatsSnapshot, create_snapshot};
use crate::engine::stats::RunStats;
use crate::engine::worker::WorkerPool;
use crate::http::{HttpExecutor, probe};
use crate::types::{AttackMode, LoadConfig, ProtocolList, Target};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything the summary needs once a run has fully stopped.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub target: Target,
    pub protocols: ProtocolList,
    /// False when the protocol list came from an explicit override
    pub probed: bool,
    pub attack: AttackMode,
    pub snapshot: StatsSnapshot,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunReport {
    /// 1 when more than half of requests failed, or when a stream-reset run never connected
    pub fn exit_code(&self) -> i32 {
        let s = &self.snapshot;
        if self.attack.is_active() {
            if s.attack_connections == 0 && s.attack_connection_errors > 0 {
                return 1;
            }
            return 0;
        }
        if s.total_requests > 0 && s.failure_rate() > 0.5 {
            1
        } else {
            0
        }
    }
}

pub struct Engine {
    config: LoadConfig,
    cancel_token: CancellationToken,
}

impl Engine {
    pub fn new(config: LoadConfig) -> Self {
        Self {
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub async fn run(self) -> Result<RunReport, String> {
        let config = &self.config;
        let target = Target::parse(&config.url)?;
        let started_at = Utc::now();

        let (protocols, probed) = match &config.protocols {
            Some(list) => (list.clone(), false),
            None => (
                probe(&target, config.probe_timeout, config.insecure).await,
                true,
            ),
        };

        let stats = Arc::new(RunStats::new());
        let breaker = Arc::new(CircuitBreaker::new(config.breaker));
        let deadline = Instant::now() + config.duration;
        // Workers get their own child so stopping them never cancels the caller's token
        let run_token = self.cancel_token.child_token();

        tracing::info!(
            target = %target.base_url,
            %protocols,
            concurrency = config.concurrency,
            duration = ?config.duration,
            attack = config.attack.as_str(),
            "Starting run"
        );

        if config.attack.is_active() {
            let driver = AttackDriver::new(
                target.clone(),
                config,
                deadline,
                stats.clone(),
                run_token,
            )?;
            let reporter = self.start_reporter(&stats, &breaker, &protocols, deadline);
            driver.run().await;
            if let Some(reporter) = reporter {
                reporter.stop().await;
            }
        } else {
            let executor = HttpExecutor::new(target.clone(), config)?;
            let dispatcher = Arc::new(FailoverDispatcher::new(
                executor,
                protocols.clone(),
                breaker.clone(),
                stats.clone(),
            )
            .with_cancel_token(run_token.clone()));
            let pool = WorkerPool::new(config.concurrency, deadline, breaker.clone(), run_token)
                .with_cooldown(config.cooldown)
                .with_drain_timeout(config.timeout + Duration::from_secs(1))
                .with_adaptive_delay(config.adaptive_delay);

            let reporter = self.start_reporter(&stats, &breaker, &protocols, deadline);
            pool.run(move || {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.dispatch().await }
            })
            .await;
            if let Some(reporter) = reporter {
                reporter.stop().await;
            }
        }

        let snapshot = create_snapshot(&stats, &breaker);
        let cancelled = self.cancel_token.is_cancelled();
        tracing::info!(
            requests = snapshot.total_requests,
            failed = snapshot.failed,
            circuit = %snapshot.circuit_state,
            cancelled,
            "Run finished"
        );

        Ok(RunReport {
            target,
            protocols,
            probed,
            attack: config.attack,
            snapshot,
            cancelled,
            started_at,
            ended_at: Utc::now(),
        })
    }

    fn start_reporter(
        &self,
        stats: &Arc<RunStats>,
        breaker: &Arc<CircuitBreaker>,
        protocols: &ProtocolList,
        deadline: Instant,
    ) -> Option<crate::engine::reporter::ReporterHandle> {
        if !self.config.live {
            return None;
        }
        let reporter = Reporter::new(
            stats.clone(),
            breaker.clone(),
            protocols.clone(),
            self.config.attack,
            deadline,
        );
        Some(reporter.spawn(self.cancel_token.child_token()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CircuitState, Protocol};
    use wiremock::matchers::any;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: String) -> LoadConfig {
        LoadConfig {
            url,
            concurrency: 10,
            duration: Duration::from_secs(1),
            protocols: Some(ProtocolList::http1_only()),
            live: false,
            ..LoadConfig::default()
        }
    }

    #[tokio::test]
    async fn test_healthy_target_run() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let report = Engine::new(config(server.uri())).run().await.unwrap();

        assert!(report.snapshot.successful > 0);
        assert_eq!(report.snapshot.failed, 0);
        assert_eq!(report.snapshot.circuit_state, CircuitState::Closed);
        assert_eq!(report.snapshot.status_codes.get(&200), Some(&report.snapshot.successful));
        assert_eq!(
            report.snapshot.protocol_counts.get(&Protocol::Http1),
            Some(&report.snapshot.successful)
        );
        assert!(!report.probed);
        assert!(!report.cancelled);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_and_opens_circuit() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut cfg = config(format!("http://127.0.0.1:{}/", port));
        cfg.breaker.threshold = 3;
        cfg.cooldown = Duration::from_millis(100);

        let report = Engine::new(cfg).run().await.unwrap();

        assert_eq!(report.snapshot.successful, 0);
        assert!(report.snapshot.failed > 0);
        assert!(report.snapshot.circuit_trips >= 1);
        assert!(report.snapshot.errors.contains_key("CIRCUIT_OPEN"));
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_deadline() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.duration = Duration::from_secs(30);
        let engine = Engine::new(cfg);
        let token = engine.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let report = engine.run().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(report.cancelled);
    }

    #[tokio::test]
    async fn test_invalid_url_is_an_error() {
        let result = Engine::new(config("ftp://example.com".to_string())).run().await;
        assert!(result.is_err());
    }
}
