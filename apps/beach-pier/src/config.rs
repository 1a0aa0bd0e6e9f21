use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Stream-push sidecar: terminates event-stream connections and coordinates them with a backend"
)]
pub struct Cli {
    /// Address to bind the listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    pub listen_addr: String,

    /// Backend endpoint receiving connect and disconnect notifications.
    #[arg(long, env = "BEACH_PIER_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Maximum seconds to wait for the backend's connect decision.
    #[arg(long, env = "BEACH_PIER_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout_secs: u64,

    /// Seconds between keep-alive comments on open streams.
    #[arg(long, env = "BEACH_PIER_HEARTBEAT_SECS", default_value_t = 15)]
    pub heartbeat_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address: {0}")]
    InvalidListenAddr(String),
    #[error("no backend notification target configured (set BEACH_PIER_BACKEND_URL)")]
    ServiceNotConfigured,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub backend_url: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr = cli
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(cli.listen_addr.clone()))?;

        let backend_url = cli
            .backend_url
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::ServiceNotConfigured)?;

        if cli.connect_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("connect timeout"));
        }
        if cli.heartbeat_secs == 0 {
            return Err(ConfigError::ZeroDuration("heartbeat interval"));
        }

        Ok(ServerConfig {
            listen_addr,
            backend_url,
            connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
            heartbeat_interval: Duration::from_secs(cli.heartbeat_secs),
        })
    }
}
