//! Environment configuration.
//!
//! Variables are read from the process environment, after loading an
//! optional `scan.env` file whose entries never override variables that are
//! already set.

use eyre::{eyre, Result};
use std::time::Duration;

use crate::node::DEFAULT_RPC_TIMEOUT;
use crate::trace::DEFAULT_STRUCT_LOG_CAP;

/// Dotenv-style file read from the working directory.
pub const ENV_FILE: &str = "scan.env";

pub const DEFAULT_CHAIN_URL: &str = "http://127.0.0.1:8545";
pub const DEFAULT_DB_PATH: &str = "data/wormscan.sqlite";
pub const DEFAULT_SERVER_ADDR: &str = ":3000";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub chain_url: String,
    /// SQLite file path.
    pub db_path: String,
    /// Listen address of the read API, which runs as a separate process.
    pub server_addr: String,
    /// Decoder worker count.
    pub threads: usize,
    /// Poll interval once the chain head is reached.
    pub interval: Duration,
    pub reset_db: bool,
    pub rpc_timeout: Duration,
    pub trace_cap: usize,
}

impl Config {
    /// Loads `scan.env` (if present) and reads the environment.
    ///
    /// # Errors
    /// Returns error if a variable is set to a value that does not parse.
    pub fn from_env() -> Result<Self> {
        match dotenvy::from_filename(ENV_FILE) {
            Ok(path) => tracing::debug!(path = %path.display(), "loaded env file"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(eyre!("failed to read {ENV_FILE}: {e}")),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source.
    ///
    /// # Errors
    /// Returns error if a variable is set to a value that does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let chain_url = var("CHAIN_URL").unwrap_or_else(|| DEFAULT_CHAIN_URL.to_string());
        validate_url("CHAIN_URL", &chain_url)?;

        let db_path = var("MYSQL_DSN")
            .map(|dsn| {
                dsn.strip_prefix("sqlite://")
                    .map(str::to_string)
                    .unwrap_or(dsn)
            })
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let threads = match var("THREAD") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(0) | Err(_) => return Err(eyre!("THREAD must be a positive integer, got `{raw}`")),
                Ok(n) => n,
            },
            None => default_threads(),
        };

        Ok(Self {
            chain_url,
            db_path,
            server_addr: var("SERVER_ADDR").unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string()),
            threads,
            interval: var("INTERVAL")
                .map(|raw| parse_duration(&raw).map_err(|e| eyre!("INTERVAL: {e}")))
                .transpose()?
                .unwrap_or(DEFAULT_INTERVAL),
            reset_db: var("RESET_DB")
                .map(|raw| parse_bool(&raw).ok_or_else(|| eyre!("RESET_DB must be a boolean, got `{raw}`")))
                .transpose()?
                .unwrap_or(false),
            rpc_timeout: var("RPC_TIMEOUT")
                .map(|raw| parse_duration(&raw).map_err(|e| eyre!("RPC_TIMEOUT: {e}")))
                .transpose()?
                .unwrap_or(DEFAULT_RPC_TIMEOUT),
            trace_cap: var("TRACE_CAP")
                .map(|raw| {
                    raw.parse::<usize>()
                        .map_err(|_| eyre!("TRACE_CAP must be an integer, got `{raw}`"))
                })
                .transpose()?
                .unwrap_or(DEFAULT_STRUCT_LOG_CAP),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain_url: DEFAULT_CHAIN_URL.to_string(),
            db_path: DEFAULT_DB_PATH.to_string(),
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            threads: default_threads(),
            interval: DEFAULT_INTERVAL,
            reset_db: false,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            trace_cap: DEFAULT_STRUCT_LOG_CAP,
        }
    }
}

/// Eight workers per logical core.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 8
}

fn validate_url(name: &str, raw: &str) -> Result<()> {
    let parsed = raw
        .parse::<reqwest::Url>()
        .map_err(|e| eyre!("{name} must be a valid URL, got `{raw}`: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(eyre!("{name} must use http(s) scheme, got `{other}`")),
    }
}

/// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses `500ms`, `1s`, `2m`, `1h`, or plain seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (value, unit) = raw.split_at(split);
    let value: f64 = value
        .parse()
        .map_err(|_| eyre!("invalid duration `{raw}`"))?;
    let secs = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(eyre!("unknown duration unit `{other}` in `{raw}`")),
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(eyre!("invalid duration `{raw}`"));
    }
    Ok(Duration::from_secs_f64(secs))
}
