//! Agent and server configuration
//!
//! Both sides load the same way: defaults, then an optional TOML file, then
//! environment variable overrides, then validation.

use crate::security::TrustedSubnet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, reason: String },
    Parse(String),
    InvalidEnv { var: &'static str, value: String },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, reason } => {
                write!(f, "cannot read config {}: {}", path.display(), reason)
            }
            ConfigError::Parse(reason) => write!(f, "malformed config: {}", reason),
            ConfigError::InvalidEnv { var, value } => {
                write!(f, "invalid value {:?} for {}", value, var)
            }
            ConfigError::Invalid(reason) => write!(f, "invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Wire protocol the agent publishes over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Http,
    Grpc,
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Transport::Http),
            "grpc" => Ok(Transport::Grpc),
            other => Err(format!("unknown transport {:?}", other)),
        }
    }
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

/// Environment intervals are whole seconds
fn seconds_to_ms(var: &'static str, value: String) -> Result<u64, ConfigError> {
    let secs: u64 = parse_env(var, value)?;
    Ok(secs.saturating_mul(1000))
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Agent-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Server address, `host:port`
    pub address: String,
    pub transport: Transport,
    pub poll_interval_ms: u64,
    pub report_interval_ms: u64,
    /// Number of concurrent publisher workers
    pub rate_limit: usize,
    /// Shared HMAC secret; signing is off when unset
    pub key: Option<String>,
    /// PEM public key used to seal request bodies
    pub crypto_key: Option<PathBuf>,
    /// Value sent as the origin IP; detected when unset
    pub origin_ip: Option<IpAddr>,
    /// CA certificate enabling TLS on the gRPC transport
    pub tls_ca: Option<PathBuf>,
    pub request_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub drain_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            address: "localhost:8080".to_string(),
            transport: Transport::Http,
            poll_interval_ms: 2_000,
            report_interval_ms: 10_000,
            rate_limit: 1,
            key: None,
            crypto_key: None,
            origin_ip: None,
            tls_ca: None,
            request_timeout_ms: 5_000,
            shutdown_timeout_ms: 10_000,
            drain_interval_ms: 1_000,
        }
    }
}

impl AgentConfig {
    /// Defaults, then `path` if given, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => read_toml(path)?,
            None => AgentConfig::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `lookup`, which maps a variable name to its value
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ADDRESS").and_then(non_empty) {
            self.address = v;
        }
        if let Some(v) = lookup("TRANSPORT").and_then(non_empty) {
            self.transport = parse_env("TRANSPORT", v)?;
        }
        if let Some(v) = lookup("POLL_INTERVAL").and_then(non_empty) {
            self.poll_interval_ms = seconds_to_ms("POLL_INTERVAL", v)?;
        }
        if let Some(v) = lookup("REPORT_INTERVAL").and_then(non_empty) {
            self.report_interval_ms = seconds_to_ms("REPORT_INTERVAL", v)?;
        }
        if let Some(v) = lookup("RATE_LIMIT").and_then(non_empty) {
            self.rate_limit = parse_env("RATE_LIMIT", v)?;
        }
        if let Some(v) = lookup("KEY").and_then(non_empty) {
            self.key = Some(v);
        }
        if let Some(v) = lookup("CRYPTO_KEY").and_then(non_empty) {
            self.crypto_key = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ORIGIN_IP").and_then(non_empty) {
            self.origin_ip = Some(parse_env("ORIGIN_IP", v)?);
        }
        if let Some(v) = lookup("TLS_CA").and_then(non_empty) {
            self.tls_ca = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::Invalid("address is empty".into()));
        }
        if self.rate_limit == 0 {
            return Err(ConfigError::Invalid("rate_limit must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 || self.report_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        if self.drain_interval_ms == 0 {
            return Err(ConfigError::Invalid("drain_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: usize) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_crypto_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.crypto_key = Some(path.into());
        self
    }

    pub fn with_origin_ip(mut self, ip: IpAddr) -> Self {
        self.origin_ip = Some(ip);
        self
    }

    pub fn with_intervals(mut self, poll: Duration, report: Duration) -> Self {
        self.poll_interval_ms = poll.as_millis() as u64;
        self.report_interval_ms = report.as_millis() as u64;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

/// Server-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub address: String,
    /// gRPC listen address; gRPC is off when unset
    pub grpc_address: Option<String>,
    pub key: Option<String>,
    /// PEM private key used to open sealed bodies
    pub crypto_key: Option<PathBuf>,
    pub trusted_subnet: Option<TrustedSubnet>,
    /// SQLite DSN; metrics stay in memory when unset
    pub database_dsn: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "0.0.0.0:8080".to_string(),
            grpc_address: None,
            key: None,
            crypto_key: None,
            trusted_subnet: None,
            database_dsn: None,
            tls_cert: None,
            tls_key: None,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => read_toml(path)?,
            None => ServerConfig::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ADDRESS").and_then(non_empty) {
            self.address = v;
        }
        if let Some(v) = lookup("GRPC_ADDRESS").and_then(non_empty) {
            self.grpc_address = Some(v);
        }
        if let Some(v) = lookup("KEY").and_then(non_empty) {
            self.key = Some(v);
        }
        if let Some(v) = lookup("CRYPTO_KEY").and_then(non_empty) {
            self.crypto_key = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TRUSTED_SUBNET").and_then(non_empty) {
            self.trusted_subnet = Some(parse_env("TRUSTED_SUBNET", v)?);
        }
        if let Some(v) = lookup("DATABASE_DSN").and_then(non_empty) {
            self.database_dsn = Some(v);
        }
        if let Some(v) = lookup("TLS_CERT").and_then(non_empty) {
            self.tls_cert = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TLS_KEY").and_then(non_empty) {
            self.tls_key = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::Invalid("address is empty".into()));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::Invalid(
                "tls_cert and tls_key must be set together".into(),
            ));
        }
        Ok(())
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_grpc_address(mut self, address: impl Into<String>) -> Self {
        self.grpc_address = Some(address.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_crypto_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.crypto_key = Some(path.into());
        self
    }

    pub fn with_trusted_subnet(mut self, subnet: TrustedSubnet) -> Self {
        self.trusted_subnet = Some(subnet);
        self
    }

    pub fn with_database_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.database_dsn = Some(dsn.into());
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

/// First CLI argument, if any, names the TOML config file
pub fn config_path_from_args() -> Option<PathBuf> {
    std::env::args_os().nth(1).map(PathBuf::from)
}
