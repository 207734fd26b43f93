use crate::engine::breaker::CircuitBreaker;
use crate::engine::stats::RunStats;
use crate::types::{CircuitState, Protocol};
use std::collections::BTreeMap;
use std::time::Duration;

/// Point-in-time copy of the run counters plus derived metrics.
///
/// Fields are read one at a time, so a snapshot taken mid-run may be
/// slightly inconsistent across counters. The final snapshot is taken after
/// every worker has stopped and is exact.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub elapsed: Duration,
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub bytes_received: u64,

    pub requests_per_sec: f64,
    pub success_rate: f64,

    pub latency_min_us: u64,
    pub latency_max_us: u64,
    pub latency_mean_us: f64,
    pub latency_p50_us: u64,
    pub latency_p95_us: u64,
    pub latency_p99_us: u64,

    pub status_codes: BTreeMap<u16, u64>,
    pub protocol_counts: BTreeMap<Protocol, u64>,
    pub errors: BTreeMap<String, u64>,

    pub circuit_state: CircuitState,
    pub circuit_failures: u32,
    pub circuit_trips: u64,

    pub attack_connections: u64,
    pub attack_connection_errors: u64,
    pub attack_streams_sent: u64,
    pub attack_streams_received: u64,
    pub attack_streams_errored: u64,
    pub attack_status_codes: BTreeMap<u16, u64>,
}

impl StatsSnapshot {
    pub fn latency_mean_ms(&self) -> f64 {
        self.latency_mean_us / 1000.0
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed as f64 / self.total_requests as f64
        }
    }
}

pub fn create_snapshot(stats: &RunStats, breaker: &CircuitBreaker) -> StatsSnapshot {
    let elapsed = stats.elapsed();
    let successful = stats.successful();
    let failed = stats.failed();
    let total_requests = successful + failed;

    let secs = elapsed.as_secs_f64();
    let requests_per_sec = if secs > 0.0 {
        total_requests as f64 / secs
    } else {
        0.0
    };

    let success_rate = if total_requests > 0 {
        successful as f64 / total_requests as f64 * 100.0
    } else {
        0.0
    };

    // Only successful attempts carry a latency sample
    let latency_mean_us = if successful > 0 {
        stats.latency_sum_us() as f64 / successful as f64
    } else {
        0.0
    };

    StatsSnapshot {
        elapsed,
        total_requests,
        successful,
        failed,
        bytes_received: stats.bytes_received(),

        requests_per_sec,
        success_rate,

        latency_min_us: stats.latency_min_us(),
        latency_max_us: stats.latency_max_us(),
        latency_mean_us,
        latency_p50_us: stats.latency_percentile(50.0),
        latency_p95_us: stats.latency_percentile(95.0),
        latency_p99_us: stats.latency_percentile(99.0),

        status_codes: stats.status_codes(),
        protocol_counts: stats.protocol_counts(),
        errors: stats.errors(),

        circuit_state: breaker.state(),
        circuit_failures: breaker.failure_count(),
        circuit_trips: breaker.trips(),

        attack_connections: stats.attack_connections(),
        attack_connection_errors: stats.attack_connection_errors(),
        attack_streams_sent: stats.attack_streams_sent(),
        attack_streams_received: stats.attack_streams_received(),
        attack_streams_errored: stats.attack_streams_errored(),
        attack_status_codes: stats.attack_status_codes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttemptError, AttemptOutcome, BreakerConfig};

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            threshold,
            open_duration: Duration::from_secs(5),
            half_open_requests: 3,
        })
    }

    #[test]
    fn test_empty_snapshot_has_zero_rates() {
        let stats = RunStats::new();
        let snapshot = create_snapshot(&stats, &breaker(10));
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.success_rate, 0.0);
        assert_eq!(snapshot.latency_mean_us, 0.0);
        assert_eq!(snapshot.latency_min_us, 0);
        assert_eq!(snapshot.failure_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_derived_metrics() {
        let stats = RunStats::new();
        stats.record_success(&AttemptOutcome::new(Protocol::Http1, 200, 1_000, 10));
        stats.record_success(&AttemptOutcome::new(Protocol::Http2, 200, 3_000, 10));
        stats.record_success(&AttemptOutcome::new(Protocol::Http2, 404, 2_000, 10));
        stats.record_failure(&AttemptError::timeout("slow"));

        let cb = breaker(1);
        cb.execute(|| async { Err::<(), _>(AttemptError::timeout("slow")) })
            .await
            .unwrap_err();

        let snapshot = create_snapshot(&stats, &cb);
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.success_rate, 75.0);
        assert_eq!(snapshot.latency_mean_us, 2_000.0);
        assert_eq!(snapshot.latency_min_us, 1_000);
        assert_eq!(snapshot.latency_max_us, 3_000);
        assert_eq!(snapshot.bytes_received, 30);
        assert_eq!(snapshot.status_codes.get(&200), Some(&2));
        assert_eq!(snapshot.protocol_counts.get(&Protocol::Http2), Some(&2));
        assert_eq!(snapshot.errors.get("ETIMEDOUT"), Some(&1));
        assert_eq!(snapshot.circuit_state, CircuitState::Open);
        assert_eq!(snapshot.circuit_trips, 1);
        assert_eq!(snapshot.failure_rate(), 0.25);
    }
}
