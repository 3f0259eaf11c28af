//! Configuration loading and validation
//!
//! The balancer is driven by a JSON document; every tuning knob has a serde
//! default so a minimal file only needs the listen address and the upstream
//! list. A parsed `Config` is an immutable snapshot: reloads produce a new
//! value and swap it atomically (see `services::config_watcher`).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SpoolError};
use crate::models::Upstream;

const DEFAULT_HEALTH_CHECK_INTERVAL: u64 = 30;
const DEFAULT_CONNECTION_TIMEOUT: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_OVERLOAD_BACKOFF_BASE_SECS: u64 = 30;
const DEFAULT_PROXY_REST_DURATION: u64 = 300;
const DEFAULT_STATS_INTERVAL: u64 = 60;

/// Immutable configuration snapshot
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen address for the HTTP proxy
    pub server: ListenConfig,
    /// Upstream SOCKS5 endpoints
    #[serde(default)]
    pub proxies: Vec<UpstreamConfig>,
    /// Selector policy ("random" or "round_robin")
    #[serde(default = "default_algorithm")]
    pub load_balancing_algorithm: String,
    /// Full probe cadence in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    /// Resting-eligibility cadence in seconds; derived from
    /// `health_check_interval` when absent
    #[serde(default)]
    pub rest_check_interval: Option<u64>,
    /// Per-upstream I/O deadline in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Consecutive transport failures before Available -> Unavailable
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base of the exponential overload backoff
    #[serde(default = "default_overload_backoff_base_secs")]
    pub overload_backoff_base_secs: u64,
    /// Upper bound on a single rest period
    #[serde(default = "default_proxy_rest_duration")]
    pub proxy_rest_duration: u64,
    /// Stats reporter cadence in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Hash)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
}

impl UpstreamConfig {
    pub fn to_upstream(&self) -> Upstream {
        Upstream::new(self.host.clone(), self.port)
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_algorithm() -> String {
    "random".to_string()
}

fn default_health_check_interval() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL
}

fn default_connection_timeout() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_overload_backoff_base_secs() -> u64 {
    DEFAULT_OVERLOAD_BACKOFF_BASE_SECS
}

fn default_proxy_rest_duration() -> u64 {
    DEFAULT_PROXY_REST_DURATION
}

fn default_stats_interval() -> u64 {
    DEFAULT_STATS_INTERVAL
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SpoolError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a configuration document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)
            .map_err(|e| SpoolError::InvalidConfig(format!("parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the balancer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(SpoolError::InvalidConfig("server.port must be nonzero".into()));
        }
        if self.server.host.is_empty() {
            return Err(SpoolError::InvalidConfig("server.host must be set".into()));
        }
        for (i, proxy) in self.proxies.iter().enumerate() {
            if proxy.host.is_empty() || proxy.port == 0 {
                return Err(SpoolError::InvalidConfig(format!(
                    "proxies[{}] must have a host and a nonzero port",
                    i
                )));
            }
        }
        match self.load_balancing_algorithm.as_str() {
            "random" | "round_robin" => {}
            other => {
                return Err(SpoolError::InvalidConfig(format!(
                    "unknown load_balancing_algorithm: {}",
                    other
                )))
            }
        }
        if self.health_check_interval == 0 {
            return Err(SpoolError::InvalidConfig(
                "health_check_interval must be nonzero".into(),
            ));
        }
        if self.connection_timeout == 0 {
            return Err(SpoolError::InvalidConfig(
                "connection_timeout must be nonzero".into(),
            ));
        }
        if self.overload_backoff_base_secs == 0 {
            return Err(SpoolError::InvalidConfig(
                "overload_backoff_base_secs must be nonzero".into(),
            ));
        }
        Ok(())
    }

    /// Listen address in `host:port` form
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Effective resting-eligibility cadence
    pub fn rest_check_interval(&self) -> u64 {
        self.rest_check_interval
            .unwrap_or_else(|| 5.max(self.health_check_interval / 6))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn overload_backoff_base(&self) -> Duration {
        Duration::from_secs(self.overload_backoff_base_secs)
    }

    pub fn rest_cap(&self) -> Duration {
        Duration::from_secs(self.proxy_rest_duration)
    }
}
