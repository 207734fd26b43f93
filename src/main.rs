mod cli;
mod config;
mod engine;
mod http;
#[cfg(feature = "http3")]
mod http3;
mod output;
mod tls;
mod types;

use clap::Parser;
use cli::{Cli, Commands, RunArgs};
use config::{load_config, merge_config};
use engine::Engine;
use output::{print_json, print_summary};
use std::io::{self, Write};
use tracing_subscriber::EnvFilter;
use types::{LoadConfig, Target};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let exit_code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    };

    std::process::exit(exit_code);
}

async fn run() -> Result<i32, String> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_load_test(&args).await,
        Commands::Init(args) => run_init(&args),
        Commands::Completions(args) => {
            cli::generate_completions(args.shell);
            Ok(0)
        }
        Commands::Man => {
            cli::generate_man_page().map_err(|e| format!("Failed to generate man page: {}", e))?;
            Ok(0)
        }
    }
}

fn run_init(args: &cli::InitArgs) -> Result<i32, String> {
    if args.output.exists() && !args.force {
        return Err(format!(
            "File '{}' already exists. Use --force to overwrite.",
            args.output.display()
        ));
    }

    let url = args
        .url
        .as_deref()
        .unwrap_or("https://staging.example.com/health");

    let config = format!(
        r#"# surge load test configuration

[target]
url = "{url}"
timeout = "8s"
connect_timeout = "2s"
probe_timeout = "3s"
# method = "GET"          # omit to randomize GET/HEAD/POST/PUT/OPTIONS
# protocols = "2,1.1"     # skip the probe and use this priority order
# insecure = false
# body = '{{"key": "value"}}'

# [target.headers]
# Authorization = "Bearer ${{API_TOKEN}}"

[load]
concurrency = 50
duration = "30s"
adaptive_delay = false
cooldown = "2s"

[breaker]
threshold = 10
open_duration = "5s"
half_open_requests = 3

[attack]
mode = "none"             # none | rapid-reset | reset-on-response
batch = 50
pause = "100ms"
"#,
        url = url
    );

    std::fs::write(&args.output, config)
        .map_err(|e| format!("Failed to write config file: {}", e))?;

    eprintln!("Created config file: {}", args.output.display());
    eprintln!("\nRun with: surge run -f {}", args.output.display());

    Ok(0)
}

async fn run_load_test(args: &RunArgs) -> Result<i32, String> {
    let toml_config = match &args.config {
        Some(path) => Some(load_config(path)?),
        None => None,
    };

    let config = merge_config(args, toml_config)?;
    let target = Target::parse(&config.url)?;

    if args.dry_run {
        print_dry_run(&config, &target);
        return Ok(0);
    }

    if !args.yes && !args.quiet && !args.json && !target.is_local() {
        confirm_remote(&target)?;
    }

    let engine = Engine::new(config.clone());
    let cancel_token = engine.cancel_token();

    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    let report = engine.run().await?;

    if args.json {
        print_json(&report, &config).map_err(|e| format!("Failed to write JSON: {}", e))?;
    } else {
        print_summary(&report);
    }

    Ok(report.exit_code())
}

fn confirm_remote(target: &Target) -> Result<(), String> {
    eprintln!("\nWARNING: Target is remote ({})", target.authority());
    eprintln!("    Sustained concurrent load may impact production systems.");
    eprint!("    Press Enter to continue or Ctrl+C to abort... ");
    io::stderr().flush().ok();

    let mut input = String::new();
    io::stdin()
        .read_line(&mut input)
        .map_err(|e| format!("Failed to read input: {}", e))?;
    Ok(())
}

fn print_dry_run(config: &LoadConfig, target: &Target) {
    eprintln!("Configuration validated successfully!\n");
    eprintln!("Target:      {}", target.base_url);
    match &config.method {
        Some(method) => eprintln!("Method:      {}", method),
        None => eprintln!("Method:      randomized"),
    }
    match &config.protocols {
        Some(list) => eprintln!("Protocols:   {} (override)", list),
        None => eprintln!("Protocols:   probe ({:?} timeout)", config.probe_timeout),
    }
    eprintln!("Concurrency: {}", config.concurrency);
    eprintln!("Duration:    {:?}", config.duration);
    eprintln!("Timeout:     {:?}", config.timeout);
    eprintln!(
        "Breaker:     threshold {}, open {:?}, {} half-open trials",
        config.breaker.threshold, config.breaker.open_duration, config.breaker.half_open_requests
    );
    eprintln!("Cooldown:    {:?}", config.cooldown);
    if config.adaptive_delay {
        eprintln!("Adaptive:    enabled");
    }
    if config.attack.is_active() {
        eprintln!(
            "Attack:      {} (batch {}, pause {:?})",
            config.attack.as_str(),
            config.attack_batch,
            config.attack_pause
        );
    }
    if !config.headers.is_empty() {
        eprintln!("Headers:     {} custom", config.headers.len());
    }
    if config.body.is_some() {
        eprintln!("Body:        present");
    }
}
