//! API server configuration

use std::net::SocketAddr;

use donorbridge_ingest::PoolConfig;
use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid BIND_ADDRESS '{0}'")]
    InvalidBindAddress(String),

    #[error(transparent)]
    Ingest(#[from] donorbridge_ingest::IngestError),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub pool: PoolConfig,
    /// Emit logs as JSON lines (`LOG_FORMAT=json`)
    pub json_logs: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
        let bind_address = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(raw.clone()))?;

        Ok(Self {
            bind_address,
            pool: PoolConfig::from_env()?,
            json_logs: json_logs_from_env(),
        })
    }
}

/// Whether `LOG_FORMAT` asks for JSON output
fn json_logs_from_env() -> bool {
    std::env::var("LOG_FORMAT")
        .map(|v| v.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
