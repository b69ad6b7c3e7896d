//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// Prefix of environment variables read by [`TollgateConfig::from_env`].
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Remote counter store URL; unset means local-only limiting
    #[serde(default)]
    pub store_url: Option<String>,

    /// Timeout for one remote increment, connect included
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Per-minute quota for anonymous traffic
    #[serde(default = "default_public_limit")]
    pub public_limit_per_minute: u32,

    /// Per-minute quota for tenants on an active paid plan
    #[serde(default = "default_paid_limit")]
    pub paid_limit_per_minute: u32,

    /// Per-minute quota for every other tenant
    #[serde(default = "default_default_limit")]
    pub default_limit_per_minute: u32,

    /// Operator overrides as `tenantId:limit,tenantId:limit`
    #[serde(default)]
    pub tenant_overrides: Option<String>,

    /// Maximum number of keys tracked by the local limiter
    #[serde(default = "default_max_buckets")]
    pub local_max_buckets: usize,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            store_url: None,
            store_timeout_ms: default_store_timeout(),
            public_limit_per_minute: default_public_limit(),
            paid_limit_per_minute: default_paid_limit(),
            default_limit_per_minute: default_default_limit(),
            tenant_overrides: None,
            local_max_buckets: default_max_buckets(),
        }
    }
}

impl RateLimitingConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_store_timeout() -> u64 {
    1000
}

fn default_public_limit() -> u32 {
    60
}

fn default_paid_limit() -> u32 {
    600
}

fn default_default_limit() -> u32 {
    120
}

fn default_max_buckets() -> usize {
    10000
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `TOLLGATE_*` environment variables.
    ///
    /// Nested keys are separated by `__`, e.g.
    /// `TOLLGATE_RATE_LIMITING__STORE_URL=redis://cache:6379`.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        let config: TollgateConfig = settings
            .try_deserialize()
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make every request fail or the local
    /// table useless.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        for (name, value) in [
            ("public_limit_per_minute", rl.public_limit_per_minute),
            ("paid_limit_per_minute", rl.paid_limit_per_minute),
            ("default_limit_per_minute", rl.default_limit_per_minute),
        ] {
            if value == 0 {
                return Err(TollgateError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if rl.local_max_buckets == 0 {
            return Err(TollgateError::Config(
                "local_max_buckets must be greater than zero".to_string(),
            ));
        }
        if rl.store_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
