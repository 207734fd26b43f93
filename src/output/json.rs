use crate::engine::RunReport;
use crate::types::LoadConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, BufWriter, Write};

#[derive(Serialize)]
pub struct JsonOutput {
    pub metadata: Metadata,
    pub summary: Summary,
    pub latency_ms: Latency,
    pub status_codes: BTreeMap<String, u64>,
    pub protocols: BTreeMap<String, u64>,
    pub errors: BTreeMap<String, u64>,
    pub breaker: Breaker,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack: Option<Attack>,
}

#[derive(Serialize)]
pub struct Metadata {
    pub tool: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub cancelled: bool,
    pub target: Target,
    pub load: Load,
    pub env: Environment,
}

#[derive(Serialize)]
pub struct Target {
    pub url: String,
    pub method: String,
    pub headers: Vec<String>,
    pub protocols: Vec<String>,
    pub protocols_detected: bool,
}

#[derive(Serialize)]
pub struct Load {
    pub concurrency: u32,
    pub duration_secs: f64,
    pub timeout_ms: u64,
    pub adaptive_delay: bool,
    pub attack: String,
}

#[derive(Serialize)]
pub struct Environment {
    pub hostname: String,
    pub os: String,
    pub cpus: usize,
}

#[derive(Serialize)]
pub struct Summary {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub requests_per_sec: f64,
    pub bytes_received: u64,
}

#[derive(Serialize)]
pub struct Latency {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Serialize)]
pub struct Breaker {
    pub state: String,
    pub trips: u64,
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub open_duration_ms: u64,
    pub half_open_requests: u32,
}

#[derive(Serialize)]
pub struct Attack {
    pub mode: String,
    pub connections: u64,
    pub connection_errors: u64,
    pub streams_sent: u64,
    pub streams_received: u64,
    pub streams_errored: u64,
    pub status_codes: BTreeMap<String, u64>,
}

fn redact_header(name: &str, value: &str) -> String {
    let lower = name.to_lowercase();
    if lower == "authorization"
        || lower == "cookie"
        || lower == "x-api-key"
        || lower.contains("token")
        || lower.contains("secret")
        || lower.contains("password")
    {
        format!("{}: <redacted>", name)
    } else {
        format!("{}: {}", name, value)
    }
}

fn ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

fn stringify_keys<K: ToString>(map: &BTreeMap<K, u64>) -> BTreeMap<String, u64> {
    map.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

pub fn create_output(report: &RunReport, config: &LoadConfig) -> JsonOutput {
    let s = &report.snapshot;

    JsonOutput {
        metadata: Metadata {
            tool: "surge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: report.started_at,
            ended_at: report.ended_at,
            duration_secs: s.elapsed.as_secs_f64(),
            cancelled: report.cancelled,
            target: Target {
                url: report.target.base_url.clone(),
                method: config
                    .method
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "random".to_string()),
                headers: config
                    .headers
                    .iter()
                    .map(|(k, v)| redact_header(k, v))
                    .collect(),
                protocols: report.protocols.iter().map(|p| p.to_string()).collect(),
                protocols_detected: report.probed,
            },
            load: Load {
                concurrency: config.concurrency,
                duration_secs: config.duration.as_secs_f64(),
                timeout_ms: config.timeout.as_millis() as u64,
                adaptive_delay: config.adaptive_delay,
                attack: report.attack.as_str().to_string(),
            },
            env: Environment {
                hostname: hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unknown".to_string()),
                os: std::env::consts::OS.to_string(),
                cpus: num_cpus(),
            },
        },
        summary: Summary {
            total_requests: s.total_requests,
            successful: s.successful,
            failed: s.failed,
            success_rate: s.success_rate,
            requests_per_sec: s.requests_per_sec,
            bytes_received: s.bytes_received,
        },
        latency_ms: Latency {
            min: ms(s.latency_min_us),
            avg: s.latency_mean_ms(),
            max: ms(s.latency_max_us),
            p50: ms(s.latency_p50_us),
            p95: ms(s.latency_p95_us),
            p99: ms(s.latency_p99_us),
        },
        status_codes: stringify_keys(&s.status_codes),
        protocols: stringify_keys(&s.protocol_counts),
        errors: s.errors.clone(),
        breaker: Breaker {
            state: s.circuit_state.as_str().to_string(),
            trips: s.circuit_trips,
            consecutive_failures: s.circuit_failures,
            threshold: config.breaker.threshold,
            open_duration_ms: config.breaker.open_duration.as_millis() as u64,
            half_open_requests: config.breaker.half_open_requests,
        },
        attack: report.attack.is_active().then(|| Attack {
            mode: report.attack.as_str().to_string(),
            connections: s.attack_connections,
            connection_errors: s.attack_connection_errors,
            streams_sent: s.attack_streams_sent,
            streams_received: s.attack_streams_received,
            streams_errored: s.attack_streams_errored,
            status_codes: stringify_keys(&s.attack_status_codes),
        }),
    }
}

pub fn print_json(report: &RunReport, config: &LoadConfig) -> io::Result<()> {
    let output = create_output(report, config);
    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());
    serde_json::to_writer_pretty(&mut writer, &output)?;
    writeln!(writer)?;
    writer.flush()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
