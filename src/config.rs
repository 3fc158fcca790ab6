//! Configuration module for the dispatchd server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How accepted connections are mapped to execution units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DispatchMode {
    /// Fixed worker pool fed by a bounded task queue
    #[value(name = "thread_pool")]
    ThreadPool,
    /// One thread per connection
    #[value(name = "threads")]
    Threads,
    /// Single-threaded readiness event loop
    #[value(name = "epoll")]
    Epoll,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchMode::ThreadPool => "thread_pool",
            DispatchMode::Threads => "threads",
            DispatchMode::Epoll => "epoll",
        };
        f.write_str(name)
    }
}

/// What the pool acceptor does when the task queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for a free slot, stalling the acceptor
    #[default]
    Block,
    /// Close the new connection immediately
    Reject,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "dispatchd")]
#[command(version)]
#[command(about = "A minimal HTTP server with pluggable connection dispatch", long_about = None)]
pub struct CliArgs {
    /// Dispatch mode
    #[arg(value_enum)]
    pub mode: DispatchMode,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:4221)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Number of pool workers (thread_pool mode)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Task queue capacity (thread_pool mode)
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Behavior when the task queue is full (thread_pool mode)
    #[arg(long, value_enum)]
    pub overflow: Option<OverflowPolicy>,

    /// Readiness events handled per poll (epoll mode)
    #[arg(long)]
    pub max_events: Option<usize>,

    /// Maximum registered connections (epoll mode)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Per-connection read/write timeout in milliseconds (0 = none)
    #[arg(long)]
    pub io_timeout_ms: Option<u64>,

    /// Maximum request size in bytes
    #[arg(long)]
    pub max_request_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub event_loop: EventLoopConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct EventLoopConfig {
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            max_connections: default_max_connections(),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            io_timeout_ms: default_io_timeout_ms(),
            max_request_size: default_max_request_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:4221".to_string()
}

fn default_backlog() -> i32 {
    128
}

fn default_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_events() -> usize {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_io_timeout_ms() -> u64 {
    5_000
}

fn default_max_request_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: DispatchMode,
    pub listen: String,
    pub backlog: i32,
    pub workers: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub max_events: usize,
    pub max_connections: usize,
    pub io_timeout_ms: u64,
    pub max_request_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(DispatchMode::ThreadPool, TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from the process arguments.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(std::env::args_os())
    }

    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let program = args
            .first()
            .and_then(|arg| Path::new(arg).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dispatchd".to_string());

        let cli = CliArgs::try_parse_from(&args).map_err(|e| ConfigError::from_clap(program, e))?;

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut config = Self::merge(cli.mode, toml_config);

        // CLI takes precedence
        if let Some(listen) = cli.listen {
            config.listen = listen;
        }
        if let Some(backlog) = cli.backlog {
            config.backlog = backlog;
        }
        if let Some(workers) = cli.workers {
            config.workers = workers;
        }
        if let Some(queue_capacity) = cli.queue_capacity {
            config.queue_capacity = queue_capacity;
        }
        if let Some(overflow) = cli.overflow {
            config.overflow = overflow;
        }
        if let Some(max_events) = cli.max_events {
            config.max_events = max_events;
        }
        if let Some(max_connections) = cli.max_connections {
            config.max_connections = max_connections;
        }
        if let Some(io_timeout_ms) = cli.io_timeout_ms {
            config.io_timeout_ms = io_timeout_ms;
        }
        if let Some(max_request_size) = cli.max_request_size {
            config.max_request_size = max_request_size;
        }
        if let Some(log_level) = cli.log_level {
            config.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }

    fn merge(mode: DispatchMode, toml: TomlConfig) -> Self {
        Self {
            mode,
            listen: toml.server.listen,
            backlog: toml.server.backlog,
            workers: toml.pool.workers,
            queue_capacity: toml.pool.queue_capacity,
            overflow: toml.pool.overflow,
            max_events: toml.event_loop.max_events,
            max_connections: toml.event_loop.max_connections,
            io_timeout_ms: toml.connection.io_timeout_ms,
            max_request_size: toml.connection.max_request_size,
            log_level: toml.logging.level,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("backlog", self.backlog > 0),
            ("workers", self.workers > 0),
            ("queue_capacity", self.queue_capacity > 0),
            ("max_events", self.max_events > 0),
            ("max_connections", self.max_connections > 0),
            ("max_request_size", self.max_request_size > 0),
        ];

        match positive.iter().find(|(_, ok)| !ok) {
            Some((name, _)) => Err(ConfigError::Invalid(format!("{name} must be at least 1"))),
            None => Ok(()),
        }
    }

    /// Per-connection read/write timeout, `None` when disabled.
    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_ms > 0).then(|| Duration::from_millis(self.io_timeout_ms))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// `--help` or `--version` was requested; not a failure.
    Help(clap::Error),
    /// Missing, extra or invalid mode. `detail` carries the parser message
    /// when the problem is with some other flag.
    Usage {
        program: String,
        detail: Option<String>,
    },
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl ConfigError {
    fn from_clap(program: String, e: clap::Error) -> Self {
        match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => return ConfigError::Help(e),
            _ => {}
        }

        let about_mode = matches!(
            e.kind(),
            ErrorKind::MissingRequiredArgument | ErrorKind::UnknownArgument
        ) || matches!(
            e.get(ContextKind::InvalidArg),
            Some(ContextValue::String(arg)) if arg.contains("MODE")
        );

        let detail = if about_mode {
            None
        } else {
            Some(e.render().to_string().trim_end().to_string())
        };

        ConfigError::Usage { program, detail }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Help(e) => write!(f, "{e}"),
            ConfigError::Usage { program, detail } => {
                if let Some(detail) = detail {
                    writeln!(f, "{detail}")?;
                }
                writeln!(f, "Usage: {program} <mode>")?;
                write!(f, "Modes: thread_pool, threads, epoll")
            }
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
