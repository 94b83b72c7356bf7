//! Configuration management for Meshguard.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{MeshguardError, Result};

/// Prefix for environment variable overrides, e.g. `MESHGUARD__GLOBAL__TIMEOUT_MS`.
pub const ENV_PREFIX: &str = "MESHGUARD";

/// Main configuration for the Meshguard engine and service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshguardConfig {
    /// Counting service listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Local bucket engine configuration
    #[serde(default)]
    pub local: LocalConfig,

    /// Global limit client configuration
    #[serde(default)]
    pub global: GlobalClientConfig,

    /// Path to the rate limit policy file
    #[serde(default)]
    pub policy_path: Option<String>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// How often idle counters are purged, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_purge_interval() -> u64 {
    30
}

/// Local bucket engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Maximum distinct descriptors held before LRU eviction
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,

    /// Number of independently locked map shards
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_buckets: default_max_buckets(),
            shards: default_shards(),
        }
    }
}

fn default_max_buckets() -> usize {
    10000
}

fn default_shards() -> usize {
    16
}

/// Global limit client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalClientConfig {
    /// Counting service URI, e.g. `http://ratelimit:8081`; unset disables global checks
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Budget for one batched check, retry included, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Maximum concurrent calls sharing the connection
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Retry once on connection-level failures while budget remains
    #[serde(default = "default_retry")]
    pub retry: bool,
}

impl Default for GlobalClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            retry: default_retry(),
        }
    }
}

impl GlobalClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    200
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_max_in_flight() -> usize {
    1024
}

fn default_retry() -> bool {
    true
}

impl MeshguardConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: MeshguardConfig =
            serde_yaml::from_str(&contents).map_err(|e| MeshguardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: MeshguardConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| MeshguardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.global.timeout_ms == 0 {
            return Err(MeshguardError::Config(
                "global.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.global.max_in_flight == 0 {
            return Err(MeshguardError::Config(
                "global.max_in_flight must be greater than zero".to_string(),
            ));
        }
        if self.local.max_buckets == 0 {
            return Err(MeshguardError::Config(
                "local.max_buckets must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
