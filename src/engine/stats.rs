use crate::types::{AttemptError, AttemptOutcome, Protocol};
use hdrhistogram::Histogram;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

const STATUS_MIN: u16 = 100;
const STATUS_MAX: u16 = 599;
const STATUS_SLOTS: usize = (STATUS_MAX - STATUS_MIN + 1) as usize;
const MAX_LATENCY_US: u64 = 60_000_000;

/// Fixed-key status code counters, one atomic slot per code in 100..=599.
/// Codes outside that range land in `other`.
pub struct StatusCounters {
    slots: Box<[AtomicU64]>,
    other: AtomicU64,
}

impl StatusCounters {
    fn new() -> Self {
        Self {
            slots: (0..STATUS_SLOTS).map(|_| AtomicU64::new(0)).collect(),
            other: AtomicU64::new(0),
        }
    }

    fn record(&self, status: u16) {
        if (STATUS_MIN..=STATUS_MAX).contains(&status) {
            self.slots[(status - STATUS_MIN) as usize].fetch_add(1, Ordering::Relaxed);
        } else {
            self.other.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Non-zero counts keyed by status code; out-of-range codes are reported as 0
    pub fn snapshot(&self) -> BTreeMap<u16, u64> {
        let mut out: BTreeMap<u16, u64> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let n = c.load(Ordering::Relaxed);
                (n > 0).then_some((STATUS_MIN + i as u16, n))
            })
            .collect();
        let other = self.other.load(Ordering::Relaxed);
        if other > 0 {
            out.insert(0, other);
        }
        out
    }
}

/// Run-wide counters written concurrently by every worker.
///
/// Every field is independently atomic; cross-field consistency is not
/// guaranteed while workers are still running.
pub struct RunStats {
    started: Instant,
    successful: AtomicU64,
    failed: AtomicU64,
    bytes_received: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_min_us: AtomicU64,
    latency_max_us: AtomicU64,
    histogram: Mutex<Histogram<u64>>,
    status_codes: StatusCounters,
    protocols: [AtomicU64; 3],
    errors: Mutex<BTreeMap<String, u64>>,

    // Stream-reset mode
    attack_connections: AtomicU64,
    attack_connection_errors: AtomicU64,
    attack_streams_sent: AtomicU64,
    attack_streams_received: AtomicU64,
    attack_streams_errored: AtomicU64,
    attack_status_codes: StatusCounters,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    pub fn new() -> Self {
        let histogram = Histogram::<u64>::new_with_bounds(1, MAX_LATENCY_US, 3)
            .expect("Failed to create histogram");

        Self {
            started: Instant::now(),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_min_us: AtomicU64::new(u64::MAX),
            latency_max_us: AtomicU64::new(0),
            histogram: Mutex::new(histogram),
            status_codes: StatusCounters::new(),
            protocols: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            errors: Mutex::new(BTreeMap::new()),
            attack_connections: AtomicU64::new(0),
            attack_connection_errors: AtomicU64::new(0),
            attack_streams_sent: AtomicU64::new(0),
            attack_streams_received: AtomicU64::new(0),
            attack_streams_errored: AtomicU64::new(0),
            attack_status_codes: StatusCounters::new(),
        }
    }

    pub fn record_success(&self, outcome: &AttemptOutcome) {
        self.successful.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(outcome.bytes_received, Ordering::Relaxed);

        let latency = outcome.latency_us.min(MAX_LATENCY_US);
        self.latency_sum_us.fetch_add(latency, Ordering::Relaxed);
        self.latency_min_us.fetch_min(latency, Ordering::Relaxed);
        self.latency_max_us.fetch_max(latency, Ordering::Relaxed);
        let _ = self
            .histogram
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(latency.max(1));

        if let Some(status) = outcome.status {
            self.status_codes.record(status);
        }
        self.protocols[outcome.protocol.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, error: &AttemptError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(error.signature())
            .or_insert(0) += 1;
    }

    pub fn record_attack_connection(&self) {
        self.attack_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attack_connection_error(&self) {
        self.attack_connection_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_sent(&self) {
        self.attack_streams_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_received(&self, status: u16) {
        self.attack_streams_received
            .fetch_add(1, Ordering::Relaxed);
        self.attack_status_codes.record(status);
    }

    pub fn record_stream_error(&self) {
        self.attack_streams_errored
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn successful(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn total_requests(&self) -> u64 {
        self.successful() + self.failed()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn latency_sum_us(&self) -> u64 {
        self.latency_sum_us.load(Ordering::Relaxed)
    }

    /// 0 until the first successful attempt
    pub fn latency_min_us(&self) -> u64 {
        match self.latency_min_us.load(Ordering::Relaxed) {
            u64::MAX => 0,
            v => v,
        }
    }

    pub fn latency_max_us(&self) -> u64 {
        self.latency_max_us.load(Ordering::Relaxed)
    }

    pub fn latency_percentile(&self, p: f64) -> u64 {
        let histogram = self.histogram.lock().unwrap_or_else(PoisonError::into_inner);
        if histogram.is_empty() {
            0
        } else {
            histogram.value_at_percentile(p)
        }
    }

    pub fn status_codes(&self) -> BTreeMap<u16, u64> {
        self.status_codes.snapshot()
    }

    pub fn protocol_counts(&self) -> BTreeMap<Protocol, u64> {
        Protocol::ALL
            .iter()
            .filter_map(|p| {
                let n = self.protocols[p.index()].load(Ordering::Relaxed);
                (n > 0).then_some((*p, n))
            })
            .collect()
    }

    pub fn errors(&self) -> BTreeMap<String, u64> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn attack_connections(&self) -> u64 {
        self.attack_connections.load(Ordering::Relaxed)
    }

    pub fn attack_connection_errors(&self) -> u64 {
        self.attack_connection_errors.load(Ordering::Relaxed)
    }

    pub fn attack_streams_sent(&self) -> u64 {
        self.attack_streams_sent.load(Ordering::Relaxed)
    }

    pub fn attack_streams_received(&self) -> u64 {
        self.attack_streams_received.load(Ordering::Relaxed)
    }

    pub fn attack_streams_errored(&self) -> u64 {
        self.attack_streams_errored.load(Ordering::Relaxed)
    }

    pub fn attack_status_codes(&self) -> BTreeMap<u16, u64> {
        self.attack_status_codes.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;
    use std::sync::Arc;

    fn outcome(protocol: Protocol, status: u16, latency_us: u64) -> AttemptOutcome {
        AttemptOutcome::new(protocol, status, latency_us, 10)
    }

    #[test]
    fn test_latency_min_max_and_sum() {
        let stats = RunStats::new();
        assert_eq!(stats.latency_min_us(), 0);

        stats.record_success(&outcome(Protocol::Http1, 200, 5_000));
        stats.record_success(&outcome(Protocol::Http1, 200, 1_000));
        stats.record_success(&outcome(Protocol::Http2, 404, 9_000));

        assert_eq!(stats.latency_min_us(), 1_000);
        assert_eq!(stats.latency_max_us(), 9_000);
        assert_eq!(stats.latency_sum_us(), 15_000);
        assert_eq!(stats.bytes_received(), 30);
        assert_eq!(stats.successful(), 3);
        assert_eq!(stats.status_codes().get(&200), Some(&2));
        assert_eq!(stats.status_codes().get(&404), Some(&1));
        assert_eq!(stats.protocol_counts().get(&Protocol::Http1), Some(&2));
        assert_eq!(stats.protocol_counts().get(&Protocol::Http3), None);
    }

    #[test]
    fn test_failures_keyed_by_signature() {
        let stats = RunStats::new();
        stats.record_failure(&AttemptError::timeout("slow"));
        stats.record_failure(&AttemptError::timeout("slower"));
        stats.record_failure(&AttemptError::new(ErrorKind::Connect, Some("ECONNREFUSED"), "x"));

        let errors = stats.errors();
        assert_eq!(errors.get("ETIMEDOUT"), Some(&2));
        assert_eq!(errors.get("ECONNREFUSED"), Some(&1));
        assert_eq!(stats.failed(), 3);
    }

    #[test]
    fn test_out_of_range_status_is_kept() {
        let stats = RunStats::new();
        stats.record_success(&outcome(Protocol::Http1, 999, 1));
        assert_eq!(stats.status_codes().get(&0), Some(&1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_increments_are_not_lost() {
        let stats = Arc::new(RunStats::new());
        let mut handles = Vec::new();

        for w in 0..100u64 {
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100u64 {
                    stats.record_success(&outcome(Protocol::Http2, 200, w * 100 + i + 1));
                    stats.record_failure(&AttemptError::timeout("t"));
                    stats.record_stream_sent();
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(stats.successful(), 10_000);
        assert_eq!(stats.failed(), 10_000);
        assert_eq!(stats.attack_streams_sent(), 10_000);
        assert_eq!(stats.status_codes().get(&200), Some(&10_000));
        assert_eq!(stats.errors().get("ETIMEDOUT"), Some(&10_000));
        assert_eq!(stats.latency_min_us(), 1);
        assert_eq!(stats.latency_max_us(), 10_000);
        assert_eq!(stats.latency_sum_us(), (1..=10_000u64).sum::<u64>());
    }
}
