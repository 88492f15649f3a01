use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

use crate::shutdown::ShutdownConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    WebSocket,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" | "sse" => Ok(Self::Http),
            "ws" | "websocket" => Ok(Self::WebSocket),
            _ => Err(ConfigError::InvalidTransport(value.to_string())),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::WebSocket => "ws",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportKind,
    pub bind_addr: String,
    pub bind_port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub drain_delay: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_TRANSPORT must be one of stdio, http or ws (got {0:?})")]
    InvalidTransport(String),
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("{0} must be a whole number of seconds")]
    InvalidDuration(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let transport = value("MCP_TRANSPORT")
            .map(|kind| kind.parse::<TransportKind>())
            .transpose()?
            .unwrap_or(TransportKind::Stdio);
        let bind_addr = value("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = value("BIND_PORT")
            .map(|port| port.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let seconds = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
            value(key)
                .map(|raw| raw.parse::<u64>().map_err(|_| ConfigError::InvalidDuration(key)))
                .transpose()
                .map(|secs| Duration::from_secs(secs.unwrap_or(default)))
        };
        let read_timeout = seconds("MCP_READ_TIMEOUT_SECS", 30)?;
        let write_timeout = seconds("MCP_WRITE_TIMEOUT_SECS", 30)?;
        let shutdown_timeout = seconds("MCP_SHUTDOWN_TIMEOUT_SECS", 30)?;
        let drain_delay = seconds("MCP_DRAIN_DELAY_SECS", 0)?;

        for (key, timeout) in [
            ("MCP_READ_TIMEOUT_SECS", read_timeout),
            ("MCP_WRITE_TIMEOUT_SECS", write_timeout),
            ("MCP_SHUTDOWN_TIMEOUT_SECS", shutdown_timeout),
        ] {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroTimeout(key));
            }
        }

        let config = Self {
            transport,
            bind_addr,
            bind_port,
            read_timeout,
            write_timeout,
            shutdown_timeout,
            drain_delay,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }

    pub fn shutdown(&self) -> ShutdownConfig {
        ShutdownConfig {
            timeout: self.shutdown_timeout,
            drain_delay: self.drain_delay,
        }
    }
}
