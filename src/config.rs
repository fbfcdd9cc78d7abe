//! Configuration module for connrate.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over the per-transport defaults.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::ToSocketAddrs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default number of concurrent submit workers.
pub const DEFAULT_WORKERS: i64 = 3;

/// Default connect/close timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default grace period for draining in-flight work on shutdown.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "connrate")]
#[command(author = "connrate authors")]
#[command(version = "0.1.0")]
#[command(about = "Test/Benchmark connection rates over TCP, UDP and HTTP/1.x", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: ProtocolCommand,
}

/// Benchmarked protocol
#[derive(Subcommand, Debug)]
pub enum ProtocolCommand {
    /// Test/Benchmark TCP connection rates
    Tcp {
        #[command(flatten)]
        target: TargetArgs,
        #[command(subcommand)]
        mode: StreamMode,
    },
    /// Test/Benchmark UDP datagram rates
    Udp {
        #[command(flatten)]
        target: DatagramTargetArgs,
        #[command(subcommand)]
        mode: PacketMode,
    },
    /// Test/Benchmark HTTP/1.x request rates
    Http1 {
        #[command(flatten)]
        target: TargetArgs,
        #[command(subcommand)]
        mode: StreamMode,
    },
    /// Test/Benchmark raw in-process channel communication rates
    Channels,
}

/// Subcommands of connection-oriented protocols
#[derive(Subcommand, Debug)]
pub enum StreamMode {
    /// Start serving
    Serve(ServeArgs),
    /// Start submitting
    Submit(SubmitArgs),
}

/// Subcommands of packet-oriented protocols
#[derive(Subcommand, Debug)]
pub enum PacketMode {
    /// Start listening
    Listen(ServeArgs),
    /// Start submitting
    Submit(SubmitArgs),
}

/// Flags shared by both sides of a protocol
#[derive(Args, Debug, Default, Clone)]
pub struct TargetArgs {
    /// The host to use
    #[arg(long)]
    pub host: Option<String>,

    /// The port to use
    #[arg(short, long)]
    pub port: Option<u16>,

    /// The timeout to use for connections and closures (e.g. 10s, 500ms)
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Enable TCP keep-alives
    #[arg(long)]
    pub keep_alives: Option<bool>,
}

/// Flags shared by both sides of a datagram protocol
#[derive(Args, Debug, Default, Clone)]
pub struct DatagramTargetArgs {
    /// The host to use
    #[arg(long)]
    pub host: Option<String>,

    /// The port to use
    #[arg(short, long)]
    pub port: Option<u16>,

    /// The timeout to use for resolving and connecting (e.g. 10s, 500ms)
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

impl From<DatagramTargetArgs> for TargetArgs {
    fn from(args: DatagramTargetArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            timeout: args.timeout,
            keep_alives: None,
        }
    }
}

/// Flags of the submit side
#[derive(Args, Debug, Default, Clone)]
pub struct SubmitArgs {
    /// The number of workers to use (-1 = unlimited)
    #[arg(short, long, allow_negative_numbers = true)]
    pub workers: Option<i64>,

    /// Stop launching new work after the first failure
    #[arg(long)]
    pub fail_fast: Option<bool>,
}

/// Flags of the serve/listen side
#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Grace period for in-flight work on shutdown (e.g. 10s)
    #[arg(long, value_parser = parse_duration)]
    pub grace: Option<Duration>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetSection,
    #[serde(default)]
    pub submit: SubmitSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Target-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct TargetSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub timeout_ms: Option<u64>,
    pub keep_alives: Option<bool>,
}

/// Submit-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct SubmitSection {
    pub workers: Option<i64>,
    pub fail_fast: Option<bool>,
}

/// Shutdown-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ShutdownSection {
    pub grace_ms: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_log_level() -> String {
    "info".to_string()
}

/// Parse a human duration such as `10s`, `500ms`, `2m`, `1h` or bare seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(input.len());
    let (value, unit) = input.split_at(split);

    let value: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration '{input}'"))?;

    let secs = match unit {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit '{other}' in '{input}'")),
    };

    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid duration '{input}'"));
    }

    Duration::try_from_secs_f64(secs).map_err(|_| format!("invalid duration '{input}'"))
}

/// Network transport being benchmarked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Http1,
}

impl Transport {
    pub fn default_host(self) -> &'static str {
        match self {
            Transport::Http1 => "localhost",
            Transport::Tcp | Transport::Udp => "127.0.0.1",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Transport::Http1 => 58085,
            Transport::Tcp => 58086,
            Transport::Udp => 58087,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("TCP"),
            Transport::Udp => f.write_str("UDP"),
            Transport::Http1 => f.write_str("HTTP/1.x"),
        }
    }
}

/// What the process was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Accept and count incoming work (`serve` / `listen`).
    Serve(Transport),
    /// Generate and count outgoing work.
    Submit(Transport),
    /// Push messages through an in-process channel.
    ChannelLoop,
}

impl Command {
    pub fn transport(self) -> Option<Transport> {
        match self {
            Command::Serve(t) | Command::Submit(t) => Some(t),
            Command::ChannelLoop => None,
        }
    }
}

/// Bound on concurrently in-flight units of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Limited(NonZeroUsize),
    Unlimited,
}

impl Concurrency {
    /// Convert a worker count where any negative value means unlimited.
    pub fn from_workers(workers: i64) -> Result<Self, ConfigError> {
        if workers < 0 {
            return Ok(Concurrency::Unlimited);
        }

        usize::try_from(workers)
            .ok()
            .and_then(NonZeroUsize::new)
            .map(Concurrency::Limited)
            .ok_or(ConfigError::InvalidWorkers(workers))
    }

    pub fn limit(self) -> Option<usize> {
        match self {
            Concurrency::Limited(n) => Some(n.get()),
            Concurrency::Unlimited => None,
        }
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concurrency::Limited(n) => write!(f, "{n}"),
            Concurrency::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// Endpoint and socket settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub keep_alives: bool,
}

impl TargetConfig {
    /// `host:port`, bracketing IPv6 literals.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Keep-alive idle time, if keep-alives are enabled.
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alives.then_some(self.timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitConfig {
    pub concurrency: Concurrency,
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownConfig {
    pub grace: Duration,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub target: TargetConfig,
    pub submit: SubmitConfig,
    pub shutdown: ShutdownConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::from_parts(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn from_parts(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let (command, target, submit, serve) = match cli.command {
            ProtocolCommand::Tcp { target, mode } => split_stream(Transport::Tcp, target, mode),
            ProtocolCommand::Http1 { target, mode } => {
                split_stream(Transport::Http1, target, mode)
            }
            ProtocolCommand::Udp { target, mode } => match mode {
                PacketMode::Listen(serve) => (
                    Command::Serve(Transport::Udp),
                    target.into(),
                    SubmitArgs::default(),
                    serve,
                ),
                PacketMode::Submit(submit) => (
                    Command::Submit(Transport::Udp),
                    target.into(),
                    submit,
                    ServeArgs::default(),
                ),
            },
            ProtocolCommand::Channels => (
                Command::ChannelLoop,
                TargetArgs::default(),
                SubmitArgs::default(),
                ServeArgs::default(),
            ),
        };

        let transport = command.transport().unwrap_or(Transport::Tcp);

        let timeout = target
            .timeout
            .or(file.target.timeout_ms.map(Duration::from_millis))
            .unwrap_or(DEFAULT_TIMEOUT);
        if timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { name: "timeout" });
        }

        let workers = submit
            .workers
            .or(file.submit.workers)
            .unwrap_or(DEFAULT_WORKERS);

        let target = TargetConfig {
            host: target
                .host
                .or(file.target.host)
                .unwrap_or_else(|| transport.default_host().to_string()),
            port: target
                .port
                .or(file.target.port)
                .unwrap_or_else(|| transport.default_port()),
            timeout,
            keep_alives: target
                .keep_alives
                .or(file.target.keep_alives)
                .unwrap_or(true),
        };
        if command.transport().is_some() {
            check_resolvable(&target)?;
        }

        Ok(Config {
            command,
            target,
            submit: SubmitConfig {
                concurrency: Concurrency::from_workers(workers)?,
                fail_fast: submit.fail_fast.or(file.submit.fail_fast).unwrap_or(true),
            },
            shutdown: ShutdownConfig {
                grace: serve
                    .grace
                    .or(file.shutdown.grace_ms.map(Duration::from_millis))
                    .unwrap_or(DEFAULT_GRACE),
            },
            log_level: cli.log_level.unwrap_or(file.logging.level),
        })
    }
}

/// Fail early on a host that does not resolve, before any socket is opened.
fn check_resolvable(target: &TargetConfig) -> Result<(), ConfigError> {
    let addr = target.addr();
    let resolved = addr
        .to_socket_addrs()
        .map_err(|source| ConfigError::Unresolvable {
            addr: addr.clone(),
            source,
        })?
        .next();

    match resolved {
        Some(_) => Ok(()),
        None => Err(ConfigError::Unresolvable {
            addr,
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
        }),
    }
}

fn split_stream(
    transport: Transport,
    target: TargetArgs,
    mode: StreamMode,
) -> (Command, TargetArgs, SubmitArgs, ServeArgs) {
    match mode {
        StreamMode::Serve(serve) => (
            Command::Serve(transport),
            target,
            SubmitArgs::default(),
            serve,
        ),
        StreamMode::Submit(submit) => (
            Command::Submit(transport),
            target,
            submit,
            ServeArgs::default(),
        ),
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid worker count '{0}'")]
    InvalidWorkers(i64),
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
    #[error("cannot resolve address '{addr}': {source}")]
    Unresolvable {
        addr: String,
        #[source]
        source: io::Error,
    },
}
