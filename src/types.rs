use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Target
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Path plus query string, always starting with `/`
    pub path: String,
    pub base_url: String,
}

impl Target {
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("Target URL is empty".to_string());
        }

        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("http://{}", input)
        };

        let url = reqwest::Url::parse(&with_scheme)
            .map_err(|e| format!("Invalid target URL '{}': {}", input, e))?;

        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(format!(
                "Unsupported scheme '{}'. Expected http or https",
                scheme
            ));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| format!("Target URL '{}' has no host", input))?
            .to_string();

        let port = url
            .port_or_known_default()
            .ok_or_else(|| format!("Cannot determine port for '{}'", input))?;

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
            base_url: url.to_string(),
        })
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// Host with brackets stripped, suitable for DNS lookups and SNI
    pub fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn authority(&self) -> String {
        let default_port = if self.is_tls() { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_local(&self) -> bool {
        let host = self.bare_host().to_lowercase();
        host == "localhost" || host == "127.0.0.1" || host == "::1" || host.ends_with(".localhost")
    }
}

// ============================================================================
// Protocols
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Http1,
    Http2,
    Http3,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Http1, Protocol::Http2, Protocol::Http3];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "HTTP/1.1",
            Protocol::Http2 => "HTTP/2",
            Protocol::Http3 => "HTTP/3",
        }
    }

    /// Slot used by fixed-size per-protocol counters
    pub fn index(&self) -> usize {
        match self {
            Protocol::Http1 => 0,
            Protocol::Http2 => 1,
            Protocol::Http3 => 2,
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_lowercase().as_str() {
            "1" | "1.1" | "h1" | "http/1.1" => Some(Protocol::Http1),
            "2" | "h2" | "http/2" => Some(Protocol::Http2),
            "3" | "h3" | "http/3" => Some(Protocol::Http3),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, non-empty, immutable list of protocols. Priority is list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolList(Arc<[Protocol]>);

impl ProtocolList {
    pub fn new(protocols: Vec<Protocol>) -> Self {
        let mut unique: Vec<Protocol> = Vec::with_capacity(protocols.len());
        for p in protocols {
            if !unique.contains(&p) {
                unique.push(p);
            }
        }
        if unique.is_empty() {
            unique.push(Protocol::Http1);
        }
        Self(unique.into())
    }

    pub fn http1_only() -> Self {
        Self::new(vec![Protocol::Http1])
    }

    /// Parse a comma-separated override such as "1.1,2,3". Unknown tokens are dropped.
    pub fn parse_override(s: &str) -> Self {
        Self::new(s.split(',').filter_map(Protocol::from_token).collect())
    }

    #[cfg(test)]
    pub fn as_slice(&self) -> &[Protocol] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Display for ProtocolList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|p| p.as_str()).collect();
        f.write_str(&names.join(", "))
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    Connect,
    Protocol,
    /// Synthetic: the attempt never left the process
    CircuitOpen,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connect => "connect",
            ErrorKind::Protocol => "protocol",
            ErrorKind::CircuitOpen => "circuit_open",
        }
    }
}

const SIGNATURE_MAX_LEN: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} error: {message}", kind.as_str())]
pub struct AttemptError {
    pub kind: ErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: ErrorKind, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, Some("ETIMEDOUT"), message)
    }

    pub fn protocol(code: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, code, message)
    }

    pub fn circuit_open() -> Self {
        Self::new(
            ErrorKind::CircuitOpen,
            Some("CIRCUIT_OPEN"),
            "circuit breaker is open",
        )
    }

    pub fn from_reqwest_error(err: &reqwest::Error) -> Self {
        let message = err.to_string();
        if err.is_timeout() {
            return Self::timeout(message);
        }

        let io_code = io_error_code(err);
        if err.is_connect() {
            let code = io_code.or_else(|| {
                let lower = message.to_lowercase();
                if lower.contains("dns") || lower.contains("resolve") {
                    Some("ENOTFOUND")
                } else {
                    None
                }
            });
            return Self::new(ErrorKind::Connect, code, message);
        }

        match io_code {
            Some(code @ ("ECONNRESET" | "ECONNABORTED" | "ECONNREFUSED")) => {
                Self::new(ErrorKind::Connect, Some(code), message)
            }
            Some("ETIMEDOUT") => Self::timeout(message),
            code => Self::protocol(code, message),
        }
    }

    /// Short key used by the error histogram
    pub fn signature(&self) -> String {
        if let Some(code) = self.code.as_deref().filter(|c| !c.is_empty()) {
            return code.to_string();
        }
        let message = self.message.trim();
        if message.is_empty() {
            return "UNKNOWN".to_string();
        }
        message.chars().take(SIGNATURE_MAX_LEN).collect()
    }
}

fn io_error_code(err: &reqwest::Error) -> Option<&'static str> {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return match io.kind() {
                std::io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
                std::io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
                std::io::ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
                std::io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
                std::io::ErrorKind::BrokenPipe => Some("EPIPE"),
                std::io::ErrorKind::AddrNotAvailable => Some("EADDRNOTAVAIL"),
                _ => None,
            };
        }
        source = inner.source();
    }
    None
}

// ============================================================================
// Attempt Outcome
// ============================================================================

/// Result of one completed request attempt. Any HTTP status counts as completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub latency_us: u64,
    pub status: Option<u16>,
    pub protocol: Protocol,
    pub bytes_received: u64,
}

impl AttemptOutcome {
    pub fn new(protocol: Protocol, status: u16, latency_us: u64, bytes_received: u64) -> Self {
        Self {
            latency_us,
            status: Some(status),
            protocol,
            bytes_received,
        }
    }
}

// ============================================================================
// Circuit State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Load Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AttackMode {
    /// Regular request load through the failover dispatcher
    #[default]
    None,
    /// Open HTTP/2 streams and cancel each one right after sending it
    RapidReset,
    /// Open HTTP/2 streams and cancel each one once its response headers arrive
    ResetOnResponse,
}

impl AttackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackMode::None => "none",
            AttackMode::RapidReset => "rapid-reset",
            AttackMode::ResetOnResponse => "reset-on-response",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, AttackMode::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub open_duration: Duration,
    pub half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            open_duration: Duration::from_secs(5),
            half_open_requests: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub url: String,
    /// Fixed request method; `None` randomizes per request
    pub method: Option<reqwest::Method>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub concurrency: u32,
    pub duration: Duration,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub insecure: bool,
    /// Explicit protocol list; skips the probe when set
    pub protocols: Option<ProtocolList>,
    pub adaptive_delay: bool,
    pub cooldown: Duration,
    pub breaker: BreakerConfig,
    pub attack: AttackMode,
    pub attack_batch: u32,
    pub attack_pause: Duration,
    pub live: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: None,
            headers: Vec::new(),
            body: None,
            concurrency: 50,
            duration: Duration::from_secs(10),
            timeout: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(3),
            insecure: false,
            protocols: None,
            adaptive_delay: false,
            cooldown: Duration::from_secs(2),
            breaker: BreakerConfig::default(),
            attack: AttackMode::None,
            attack_batch: 50,
            attack_pause: Duration::from_millis(100),
            live: true,
        }
    }
}
