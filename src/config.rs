use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(
    name = "rustcon",
    version,
    about = "Bridges a WebSocket RCON endpoint into Redis queues and scripted InfluxDB stats"
)]
pub struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "rustcon.conf")]
    pub config: PathBuf,

    /// RCON hostname
    #[arg(long, default_value = "localhost")]
    pub hostname: String,

    /// RCON port
    #[arg(long, default_value_t = 28016)]
    pub port: u16,

    /// Path to a file containing the RCON password
    #[arg(long, default_value = ".rconpass")]
    pub passfile: PathBuf,

    /// A unique identifier that tags this server; defaults to host:port
    #[arg(long)]
    pub tag: Option<String>,

    /// Force debug log level
    #[arg(long)]
    pub debug: bool,

    /// Dry-run mode: stats writes go to stdout instead of InfluxDB
    #[arg(long)]
    pub test: bool,
}

fn default_max_queue_size() -> i64 {
    100
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub enable_redis_queue: bool,
    #[serde(default)]
    pub enable_influx_stats: bool,
    #[serde(default)]
    pub queues_prefix: String,
    #[serde(default)]
    pub interval_callbacks: Vec<IntervalCallbackConfig>,
    #[serde(default)]
    pub static_queues: Vec<String>,
    #[serde(default)]
    pub dynamic_queue_key: Option<String>,
    #[serde(default)]
    pub callback_queue_key: Option<String>,
    #[serde(default)]
    pub callback_expire: u64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: i64,
    #[serde(default)]
    pub call_onmessage_on_invoke: bool,
    #[serde(default)]
    pub ignore_empty_rcon_messages: bool,
    #[serde(default)]
    pub onconnect_delay: u64,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub influx: InfluxConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntervalCallbackConfig {
    pub command: String,
    pub storage_key: String,
    #[serde(default)]
    pub interval: i64,
    #[serde(default)]
    pub run_on_connect: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub hostname: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: String,
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            hostname: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    #[serde(default = "default_influx_host")]
    pub hostname: String,
    #[serde(default = "default_influx_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub ssl: bool,
}

fn default_influx_host() -> String {
    "localhost".to_string()
}

fn default_influx_port() -> u16 {
    8086
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            hostname: default_influx_host(),
            port: default_influx_port(),
            username: String::new(),
            password: String::new(),
            database: String::new(),
            ssl: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsConfig {
    #[serde(default)]
    pub invoked: Vec<InvokedStatConfig>,
    #[serde(default)]
    pub internal: Vec<InternalStatConfig>,
    #[serde(default)]
    pub monitored: Vec<MonitoredStatConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvokedStatConfig {
    pub command: String,
    pub script: String,
    pub interval: i64,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InternalStatConfig {
    pub script: String,
    pub interval: i64,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoredStatConfig {
    pub pattern: String,
    pub script: String,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            file: None,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let metadata =
        fs::metadata(path).with_context(|| format!("{} not found", path.display()))?;
    if metadata.is_dir() {
        bail!("{} is a directory", path.display());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("error reading {}", path.display()))?;
    let config: Config = serde_json::from_str(&raw)
        .with_context(|| format!("JSON parse error in {}", path.display()))?;
    Ok(config)
}

/// The passfile is a single line; surrounding whitespace is trimmed.
pub fn load_rcon_password(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("error reading {}", path.display()))?;
    Ok(raw.trim().to_string())
}
