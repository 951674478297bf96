//! Client configuration
//!
//! Connection settings come from the environment once, at construction.
//! Timing knobs default to the values the cache and coordinator were tuned
//! for and can be overridden with the `with_*` builders.

use std::ops::Range;
use std::time::Duration;

use url::Url;

use crate::protocol::error::{RegcacheError, Result};

pub const ENV_REGISTRY_ADDR: &str = "CONSUL_ADDR";
pub const ENV_REGISTRY_TOKEN: &str = "CONSUL_TOKEN";
pub const ENV_REGISTRY_DC: &str = "CONSUL_DC";
pub const ENV_ZONE: &str = "CONSUL_ZONE";
pub const ENV_ENVIRONMENT: &str = "CONSUL_ENV";

pub const DEFAULT_REGISTRY_ADDR: &str = "127.0.0.1:8500";
pub const DEFAULT_ZONE: &str = "UNZONE";
pub const DEFAULT_ENVIRONMENT: &str = "TEST";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry agent address, `host:port` or a full URL
    pub address: String,
    /// Sent as `X-Consul-Token` when set
    pub token: Option<String>,
    pub datacenter: Option<String>,
    /// Stamped into every registration's metadata
    pub zone: String,
    /// Environment label (TEST, PRODUCT, ALPHA, BETA...)
    pub environment: String,
    /// How often the snapshot is refreshed
    pub refresh_interval: Duration,
    /// Age after which a snapshot is reported stale (it is still served)
    pub snapshot_ttl: Duration,
    /// Upper bound on the shutdown drain
    pub drain_timeout: Duration,
    /// Per-request timeout applied by the HTTP transport
    pub request_timeout: Duration,
    /// Ports tried for the default health endpoint
    pub health_port_range: Range<u16>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_REGISTRY_ADDR.to_string(),
            token: None,
            datacenter: None,
            zone: DEFAULT_ZONE.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            refresh_interval: Duration::from_secs(5),
            snapshot_ttl: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            health_port_range: 30000..40000,
        }
    }
}

impl RegistryConfig {
    /// Reads connection settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; missing or empty values
    /// fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            address: get(ENV_REGISTRY_ADDR).unwrap_or(defaults.address),
            token: get(ENV_REGISTRY_TOKEN),
            datacenter: get(ENV_REGISTRY_DC),
            zone: get(ENV_ZONE).unwrap_or(defaults.zone),
            environment: get(ENV_ENVIRONMENT).unwrap_or(defaults.environment),
            ..defaults
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_health_port_range(mut self, range: Range<u16>) -> Self {
        self.health_port_range = range;
        self
    }

    /// Base URL of the registry agent, adding `http://` to bare addresses.
    pub fn base_url(&self) -> String {
        let addr = self.address.trim_end_matches('/');
        if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        }
    }

    /// Rejects settings the background tasks cannot run with.
    ///
    /// The agent transport speaks plain HTTP only, so any other scheme is a
    /// configuration error rather than a transport failure on every call.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(RegcacheError::Configuration("registry address is empty".to_string()));
        }
        let url = Url::parse(&self.base_url()).map_err(|e| {
            RegcacheError::Configuration(format!("registry address {}: {}", self.address, e))
        })?;
        if url.scheme() != "http" {
            return Err(RegcacheError::Configuration(format!(
                "registry address {}: unsupported scheme {}, only http is supported",
                self.address,
                url.scheme()
            )));
        }
        if self.refresh_interval.is_zero() {
            return Err(RegcacheError::Configuration("refresh interval must be positive".to_string()));
        }
        if self.health_port_range.is_empty() {
            return Err(RegcacheError::Configuration(format!(
                "health port range {:?} is empty",
                self.health_port_range
            )));
        }
        Ok(())
    }
}
