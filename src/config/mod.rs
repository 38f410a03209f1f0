use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::donation::{is_valid_address, normalize_address};

const PLACEHOLDER_MARKERS: [&str; 3] = ["YOUR_", "YOUR-", "<"];
const PLACEHOLDER_CONTRACT: &str = "YOUR_DEPLOYED_CONTRACT_ADDRESS";

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    pub cache: CacheConfig,
}

impl ApiConfig {
    pub fn load() -> Result<Self> {
        let configured_path =
            std::env::var("EDTECH_API_CONFIG").unwrap_or_else(|_| "config/api.toml".to_string());
        assert!(
            configured_path.len() < 4096,
            "Configuration path length exceeds hard limit"
        );

        let mut builder = Config::builder()
            .set_default("server.port", 8001)?
            .set_default("database.max_connections", 10)?
            .set_default("mirror.poll_interval_ms", 10_000)?
            .set_default("cache.stats_max_capacity", 64)?
            .set_default("cache.stats_ttl_seconds", 30)?
            .add_source(File::new(&configured_path, FileFormat::Toml).required(false));

        if let Ok(env_override) = std::env::var("EDTECH_API_ENV") {
            if !env_override.is_empty() {
                let env_file = format!("config/api.{}.toml", env_override);
                if Path::new(&env_file).exists() {
                    builder = builder.add_source(File::new(&env_file, FileFormat::Toml));
                }
            }
        }

        // Plain variables used by existing deployments take precedence.
        let settings = builder
            .add_source(
                Environment::with_prefix("EDTECH")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.allowed_origins")
                    .try_parsing(true),
            )
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("chain.rpc_url", std::env::var("ETHEREUM_RPC_URL").ok())?
            .set_override_option(
                "chain.contract_address",
                std::env::var("CONTRACT_ADDRESS").ok(),
            )?
            .build()
            .map_err(|err| map_config_error(err, &configured_path))?;

        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize API configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        anyhow::ensure!(
            !self.database.url.trim().is_empty(),
            "Database URL must be specified"
        );
        anyhow::ensure!(self.server.port > 0, "Server port must be greater than zero");
        self.mirror.ensure_bounds()?;
        self.cache.ensure_bounds()?;
        if let Some(millis) = self.chain.request_timeout_ms {
            anyhow::ensure!(
                (100..=60_000).contains(&millis),
                "RPC timeout must be between 100ms and 60 seconds"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Option<IpAddr>,
    pub port: u16,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn address(&self) -> SocketAddr {
        let host = self.host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(self.port != 0, "HTTP port cannot be zero");
        SocketAddr::new(host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: Option<String>,
    pub contract_address: Option<String>,
    pub request_timeout_ms: Option<u64>,
}

/// Validated chain endpoint and contract the mirror should follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSyncTarget {
    pub rpc_url: String,
    pub contract_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainConfigIssue {
    #[error("ETHEREUM_RPC_URL is not configured")]
    MissingRpcUrl,
    #[error("ETHEREUM_RPC_URL still holds a placeholder value")]
    PlaceholderRpcUrl,
    #[error("CONTRACT_ADDRESS is not configured")]
    MissingContractAddress,
    #[error("CONTRACT_ADDRESS still holds a placeholder value")]
    PlaceholderContractAddress,
    #[error("CONTRACT_ADDRESS {0} is not a valid address")]
    InvalidContractAddress(String),
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        let millis = self.request_timeout_ms.unwrap_or(10_000);
        assert!(millis >= 100, "RPC timeout must be at least 100ms");
        assert!(millis <= 60_000, "RPC timeout cannot exceed 60 seconds");
        Duration::from_millis(millis)
    }

    pub fn sync_target(&self) -> Result<ChainSyncTarget, ChainConfigIssue> {
        let rpc_url = match self.rpc_url.as_deref().map(str::trim) {
            None | Some("") => return Err(ChainConfigIssue::MissingRpcUrl),
            Some(url) if is_placeholder(url) => return Err(ChainConfigIssue::PlaceholderRpcUrl),
            Some(url) => url.to_string(),
        };

        let contract_address = match self.contract_address.as_deref().map(str::trim) {
            None | Some("") => return Err(ChainConfigIssue::MissingContractAddress),
            Some(address)
                if address.eq_ignore_ascii_case(PLACEHOLDER_CONTRACT) || is_placeholder(address) =>
            {
                return Err(ChainConfigIssue::PlaceholderContractAddress);
            }
            Some(address) if !is_valid_address(address) => {
                return Err(ChainConfigIssue::InvalidContractAddress(address.to_string()));
            }
            Some(address) => normalize_address(address)
                .map_err(|_| ChainConfigIssue::InvalidContractAddress(address.to_string()))?,
        };

        Ok(ChainSyncTarget {
            rpc_url,
            contract_address,
        })
    }
}

fn is_placeholder(value: &str) -> bool {
    let upper = value.to_ascii_uppercase();
    PLACEHOLDER_MARKERS
        .iter()
        .any(|marker| upper.contains(marker))
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    pub poll_interval_ms: u64,
    /// Consecutive failed iterations after which an event is quarantined.
    /// Unset means retry forever.
    pub max_event_attempts: Option<u32>,
}

impl MirrorConfig {
    pub fn poll_interval(&self) -> Duration {
        assert!(
            self.poll_interval_ms >= 100,
            "Poll interval must be >= 100ms"
        );
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ensure_bounds(&self) -> Result<()> {
        anyhow::ensure!(
            (100..=3_600_000).contains(&self.poll_interval_ms),
            "Poll interval must be between 100ms and one hour"
        );
        if let Some(attempts) = self.max_event_attempts {
            anyhow::ensure!(attempts > 0, "max_event_attempts must be positive");
        }
        Ok(())
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            max_event_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub stats_max_capacity: u64,
    pub stats_ttl_seconds: u64,
}

impl CacheConfig {
    fn ensure_bounds(&self) -> Result<()> {
        anyhow::ensure!(
            self.stats_max_capacity >= 1,
            "Stats cache capacity must be positive"
        );
        anyhow::ensure!(
            self.stats_ttl_seconds <= 86_400,
            "Stats cache TTL cannot exceed one day"
        );
        Ok(())
    }
}

fn map_config_error(err: ConfigError, path: &str) -> ConfigError {
    match err {
        ConfigError::NotFound(_) => ConfigError::NotFound(path.to_string()),
        other => other,
    }
}
