use crate::engine::breaker::CircuitBreaker;
use crate::engine::snapshot::{StatsSnapshot, create_snapshot};
use crate::engine::stats::RunStats;
use crate::types::{AttackMode, ProtocolList};
use crossterm::cursor::MoveToColumn;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Periodically redraws a single status line on stderr.
pub struct Reporter {
    stats: Arc<RunStats>,
    breaker: Arc<CircuitBreaker>,
    protocols: ProtocolList,
    attack: AttackMode,
    deadline: Instant,
    interval: Duration,
}

/// Running reporter. Consumed by [`ReporterHandle::stop`], so it can only be stopped once.
pub struct ReporterHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ReporterHandle {
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::debug!("Reporter task ended abnormally: {}", e);
        }
    }
}

impl Reporter {
    pub fn new(
        stats: Arc<RunStats>,
        breaker: Arc<CircuitBreaker>,
        protocols: ProtocolList,
        attack: AttackMode,
        deadline: Instant,
    ) -> Self {
        Self {
            stats,
            breaker,
            protocols,
            attack,
            deadline,
            interval: REPORT_INTERVAL,
        }
    }

    pub fn spawn(self, token: CancellationToken) -> ReporterHandle {
        let task = tokio::spawn(self.run(token.clone()));
        ReporterHandle { token, task }
    }

    async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut drawn = false;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = create_snapshot(&self.stats, &self.breaker);
                    let remaining = self.deadline.saturating_duration_since(Instant::now());
                    let line = render_line(&snapshot, remaining, &self.protocols, self.attack);
                    if draw(&line).is_ok() {
                        drawn = true;
                    }
                }
            }
        }

        if drawn {
            eprintln!();
        }
    }
}

fn draw(line: &str) -> io::Result<()> {
    let mut stderr = io::stderr().lock();
    crossterm::queue!(
        stderr,
        MoveToColumn(0),
        Clear(ClearType::CurrentLine),
        Print(line)
    )?;
    stderr.flush()
}

pub fn render_line(
    snapshot: &StatsSnapshot,
    remaining: Duration,
    protocols: &ProtocolList,
    attack: AttackMode,
) -> String {
    let clock = format!(
        "[{:>5.1}s | {:>5.1}s left]",
        snapshot.elapsed.as_secs_f64(),
        remaining.as_secs_f64()
    );

    if attack.is_active() {
        return format!(
            "{} {} conns {} (err {}) | streams sent {} recv {} err {}",
            clock,
            attack.as_str(),
            snapshot.attack_connections,
            snapshot.attack_connection_errors,
            snapshot.attack_streams_sent,
            snapshot.attack_streams_received,
            snapshot.attack_streams_errored,
        );
    }

    format!(
        "{} ok {} fail {} | avg {:.1}ms | {:.0} req/s | {:.1}% | circuit {} | {}",
        clock,
        snapshot.successful,
        snapshot.failed,
        snapshot.latency_mean_ms(),
        snapshot.requests_per_sec,
        snapshot.success_rate,
        snapshot.circuit_state,
        protocols,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttemptOutcome, BreakerConfig, Protocol};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::default())
    }

    #[test]
    fn test_render_line_request_mode() {
        let stats = RunStats::new();
        stats.record_success(&AttemptOutcome::new(Protocol::Http2, 200, 12_000, 0));
        let snapshot = create_snapshot(&stats, &breaker());
        let protocols = ProtocolList::new(vec![Protocol::Http2, Protocol::Http1]);

        let line = render_line(&snapshot, Duration::from_secs(4), &protocols, AttackMode::None);
        assert!(line.contains("ok 1 fail 0"));
        assert!(line.contains("avg 12.0ms"));
        assert!(line.contains("100.0%"));
        assert!(line.contains("circuit CLOSED"));
        assert!(line.contains("HTTP/2, HTTP/1.1"));
        assert!(line.contains("4.0s left"));
    }

    #[test]
    fn test_render_line_attack_mode() {
        let stats = RunStats::new();
        stats.record_attack_connection();
        stats.record_stream_sent();
        stats.record_stream_sent();
        let snapshot = create_snapshot(&stats, &breaker());

        let line = render_line(
            &snapshot,
            Duration::ZERO,
            &ProtocolList::http1_only(),
            AttackMode::RapidReset,
        );
        assert!(line.contains("rapid-reset"));
        assert!(line.contains("conns 1 (err 0)"));
        assert!(line.contains("sent 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_task() {
        let stats = Arc::new(RunStats::new());
        let reporter = Reporter::new(
            stats,
            Arc::new(breaker()),
            ProtocolList::http1_only(),
            AttackMode::None,
            Instant::now() + Duration::from_secs(10),
        );

        let token = CancellationToken::new();
        let handle = reporter.spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        handle.stop().await;
        assert!(token.is_cancelled());
    }
}
