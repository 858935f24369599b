use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::SessionConfig;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 4040)
    pub port: u16,
    /// Cluster-unique node id (default: random UUID)
    pub node_id: String,
    /// Address other nodes redirect clients to (default: HOST:PORT)
    pub advertise_addr: String,
    /// Database file path (default: ./scrivener.db)
    pub database_path: PathBuf,
    /// Virtual nodes per member on the hash ring (default: 64)
    pub virtual_nodes: usize,
    /// Operations kept in each session's transform window (default: 256)
    pub window_size: usize,
    /// Heartbeat period (default: 2s)
    pub heartbeat_interval: Duration,
    /// Silence after which a node is expired (default: 10s)
    pub heartbeat_timeout: Duration,
    /// Delay before retired versions are deleted (default: 300s)
    pub retired_grace: Duration,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "4040".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let node_id = env::var("NODE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        if node_id.trim().is_empty() {
            return Err(ConfigError::InvalidNodeId);
        }
        let advertise_addr =
            env::var("ADVERTISE_ADDR").unwrap_or_else(|_| format!("{}:{}", host, port));

        let database_path = PathBuf::from(
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./scrivener.db".to_string()),
        );

        let virtual_nodes = parse_positive("VIRTUAL_NODES", 64)?;
        let window_size = parse_positive("WINDOW_SIZE", 256)?;
        let heartbeat_interval = Duration::from_secs(parse_positive("HEARTBEAT_INTERVAL_SECS", 2)?);
        let heartbeat_timeout = Duration::from_secs(parse_positive("HEARTBEAT_TIMEOUT_SECS", 10)?);
        if heartbeat_timeout <= heartbeat_interval {
            return Err(ConfigError::InvalidNumber("HEARTBEAT_TIMEOUT_SECS"));
        }
        let retired_grace = Duration::from_secs(
            env::var("RETIRED_GRACE_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("RETIRED_GRACE_SECS"))?,
        );

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            host,
            port,
            node_id,
            advertise_addr,
            database_path,
            virtual_nodes: virtual_nodes as usize,
            window_size: window_size as usize,
            heartbeat_interval,
            heartbeat_timeout,
            retired_grace,
            cors_origins,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Per-session settings derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            window_size: self.window_size,
            ..SessionConfig::default()
        }
    }
}

fn parse_positive(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(ConfigError::InvalidNumber(name)),
            Ok(n) => Ok(n),
        },
        Err(_) => Ok(default),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidNodeId,
    InvalidNumber(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidNodeId => write!(f, "NODE_ID must not be empty"),
            ConfigError::InvalidNumber(name) => {
                write!(f, "Invalid {} environment variable", name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
