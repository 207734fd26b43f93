use crate::types::AttackMode;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

#[derive(Parser, Debug)]
#[command(
    name = "surge",
    author,
    version,
    about = "A resilient HTTP load generator with protocol failover and a circuit breaker",
    long_about = "surge drives concurrent HTTP load against a single target, fails over between\n\
                  HTTP/3, HTTP/2 and HTTP/1.1 per request, and backs off through a circuit\n\
                  breaker when the target degrades."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a load test
    #[command(name = "run")]
    Run(Box<RunArgs>),

    /// Generate a starter config file
    Init(InitArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),

    /// Generate man page
    Man,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Target URL to load test
    #[arg(required_unless_present = "config")]
    pub url: Option<String>,

    /// Number of concurrent workers
    #[arg(short = 'c', long, default_value = "50")]
    pub concurrency: u32,

    /// Test duration (e.g., 10s, 1m, 30s)
    #[arg(short = 'd', long, default_value = "10s", value_parser = parse_duration)]
    pub duration: Duration,

    /// Stream-reset load mode (HTTP/2 only); bypasses failover and the breaker
    #[arg(long, value_enum, default_value = "none")]
    pub attack: AttackMode,

    /// Comma-separated protocol list in priority order (e.g., "2,1.1"); skips the probe
    #[arg(short = 'p', long, value_name = "LIST")]
    pub protocols: Option<String>,

    /// Slow down when the target answers 429, 503 or 403
    #[arg(long)]
    pub adaptive_delay: bool,

    /// Request timeout (e.g., 8s)
    #[arg(long, default_value = "8s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Connection timeout (e.g., 2s)
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    pub connect_timeout: Duration,

    /// Timeout for the startup protocol probe
    #[arg(long, default_value = "3s", value_parser = parse_duration)]
    pub probe_timeout: Duration,

    /// Fixed HTTP method (randomized per request when omitted)
    #[arg(short = 'm', long)]
    pub method: Option<String>,

    /// HTTP headers (can be specified multiple times)
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// Request body for POST/PUT
    #[arg(short = 'b', long)]
    pub body: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Consecutive failures that open the circuit
    #[arg(long, default_value = "10")]
    pub breaker_threshold: u32,

    /// How long the circuit stays open before a trial request
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub open_duration: Duration,

    /// Successful trials needed to close the circuit again
    #[arg(long, default_value = "3")]
    pub half_open_requests: u32,

    /// Worker pause after a failure while the circuit is open
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    pub cooldown: Duration,

    /// Streams opened per connection in stream-reset mode
    #[arg(long, default_value = "50")]
    pub attack_batch: u32,

    /// Pause between stream-reset rounds
    #[arg(long, default_value = "100ms", value_parser = parse_duration)]
    pub attack_pause: Duration,

    /// Config file path (TOML)
    #[arg(short = 'f', long = "config")]
    pub config: Option<PathBuf>,

    /// Print the final summary as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Suppress the live status line
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Skip confirmation for remote targets
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Validate config and exit without running
    #[arg(long)]
    pub dry_run: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            url: None,
            concurrency: 50,
            duration: Duration::from_secs(10),
            attack: AttackMode::None,
            protocols: None,
            adaptive_delay: false,
            timeout: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(3),
            method: None,
            headers: Vec::new(),
            body: None,
            insecure: false,
            breaker_threshold: 10,
            open_duration: Duration::from_secs(5),
            half_open_requests: 3,
            cooldown: Duration::from_secs(2),
            attack_batch: 50,
            attack_pause: Duration::from_millis(100),
            config: None,
            json: false,
            quiet: false,
            yes: false,
            dry_run: false,
        }
    }
}

impl RunArgs {
    pub fn parse_headers(&self) -> Result<Vec<(String, String)>, String> {
        self.headers
            .iter()
            .map(|h| {
                let (name, value) = h.split_once(':').ok_or_else(|| {
                    format!("Invalid header format: {}. Expected 'Name: Value'", h)
                })?;
                Ok((name.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Output file path
    #[arg(short, long, default_value = "surge.toml")]
    pub output: PathBuf,

    /// Target URL to include in config
    #[arg(short, long)]
    pub url: Option<String>,

    /// Overwrite existing file
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "surge", &mut std::io::stdout());
}

pub fn generate_man_page() -> Result<(), std::io::Error> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    man.render(&mut std::io::stdout())
}
