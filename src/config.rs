use crate::cli::RunArgs;
use crate::types::{AttackMode, BreakerConfig, LoadConfig, ProtocolList};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub load: LoadSettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub attack: AttackSettings,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub url: Option<String>,
    pub method: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub probe_timeout: Option<Duration>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    /// Same syntax as `--protocols`, e.g. "2,1.1"
    pub protocols: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoadSettings {
    pub concurrency: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub adaptive_delay: bool,
    #[serde(default, with = "humantime_serde::option")]
    pub cooldown: Option<Duration>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BreakerSettings {
    pub threshold: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    pub open_duration: Option<Duration>,
    pub half_open_requests: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AttackSettings {
    pub mode: Option<AttackMode>,
    pub batch: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    pub pause: Option<Duration>,
}

pub fn load_config(path: &Path) -> Result<TomlConfig, String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read config file: {}", e))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<TomlConfig, String> {
    let content = interpolate_env_vars(content)?;
    toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))
}

/// Expand `${VAR}` and `${VAR:-default}` from the environment. Comment lines are left alone.
fn interpolate_env_vars(content: &str) -> Result<String, String> {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}").map_err(|e| e.to_string())?;
    let mut result = String::with_capacity(content.len());

    for line in content.split_inclusive('\n') {
        if line.trim_start().starts_with('#') {
            result.push_str(line);
            continue;
        }

        let mut last = 0;
        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else { continue };
            let expr = &cap[1];

            let (name, default) = match expr.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (expr, None),
            };

            let value = match (std::env::var(name), default) {
                (Ok(v), _) => v,
                (Err(_), Some(d)) => d.to_string(),
                (Err(_), None) => return Err(format!("Environment variable '{}' not set", name)),
            };

            result.push_str(&line[last..whole.start()]);
            result.push_str(&value);
            last = whole.end();
        }
        result.push_str(&line[last..]);
    }

    Ok(result)
}

/// CLI value when it differs from its default, else the file value, else the default
fn pick<T: PartialEq>(cli: T, default: T, file: Option<T>) -> T {
    if cli != default {
        cli
    } else {
        file.unwrap_or(default)
    }
}

pub fn merge_config(args: &RunArgs, toml: Option<TomlConfig>) -> Result<LoadConfig, String> {
    let toml = toml.unwrap_or_default();
    let defaults = RunArgs::default();

    let url = args
        .url
        .clone()
        .or(toml.target.url)
        .ok_or("URL is required. Provide via argument or config file.")?;

    let method = match args.method.clone().or(toml.target.method) {
        Some(m) => Some(
            m.to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|_| format!("Invalid HTTP method: {}", m))?,
        ),
        None => None,
    };

    let mut headers = args.parse_headers()?;
    for (k, v) in toml.target.headers {
        if !headers.iter().any(|(hk, _)| hk.eq_ignore_ascii_case(&k)) {
            headers.push((k, v));
        }
    }

    let protocols = args
        .protocols
        .as_deref()
        .or(toml.target.protocols.as_deref())
        .map(ProtocolList::parse_override);

    let breaker = BreakerConfig {
        threshold: pick(
            args.breaker_threshold,
            defaults.breaker_threshold,
            toml.breaker.threshold,
        ),
        open_duration: pick(
            args.open_duration,
            defaults.open_duration,
            toml.breaker.open_duration,
        ),
        half_open_requests: pick(
            args.half_open_requests,
            defaults.half_open_requests,
            toml.breaker.half_open_requests,
        ),
    };

    let config = LoadConfig {
        url,
        method,
        headers,
        body: args.body.clone().or(toml.target.body),
        concurrency: pick(args.concurrency, defaults.concurrency, toml.load.concurrency),
        duration: pick(args.duration, defaults.duration, toml.load.duration),
        timeout: pick(args.timeout, defaults.timeout, toml.target.timeout),
        connect_timeout: pick(
            args.connect_timeout,
            defaults.connect_timeout,
            toml.target.connect_timeout,
        ),
        probe_timeout: pick(
            args.probe_timeout,
            defaults.probe_timeout,
            toml.target.probe_timeout,
        ),
        insecure: args.insecure || toml.target.insecure,
        protocols,
        adaptive_delay: args.adaptive_delay || toml.load.adaptive_delay,
        cooldown: pick(args.cooldown, defaults.cooldown, toml.load.cooldown),
        breaker,
        attack: pick(args.attack, defaults.attack, toml.attack.mode),
        attack_batch: pick(args.attack_batch, defaults.attack_batch, toml.attack.batch),
        attack_pause: pick(args.attack_pause, defaults.attack_pause, toml.attack.pause),
        live: !args.quiet && !args.json,
    };

    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &LoadConfig) -> Result<(), String> {
    if config.concurrency == 0 {
        return Err("Concurrency must be at least 1".to_string());
    }
    if config.duration.is_zero() {
        return Err("Duration must be greater than zero".to_string());
    }
    if config.breaker.threshold == 0 {
        return Err("Breaker threshold must be at least 1".to_string());
    }
    if config.breaker.half_open_requests == 0 {
        return Err("Half-open requests must be at least 1".to_string());
    }
    if config.attack.is_active() && config.attack_batch == 0 {
        return Err("Attack batch must be at least 1".to_string());
    }
    Ok(())
}
