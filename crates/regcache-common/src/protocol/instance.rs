use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use url::Url;

use crate::protocol::error::{RegcacheError, Result};

pub type InstanceId = String;
pub type ServiceName = String;
pub type Metadata = BTreeMap<String, String>;

/// Metadata key holding the instance's zone (cluster partition of a service).
pub const META_ZONE: &str = "zone";
/// Metadata key holding the deployment environment label.
pub const META_ENV: &str = "env";
/// Metadata key holding the URL scheme the instance was registered with.
pub const META_SCHEME: &str = "scheme";
/// Optional metadata key read by weighted selection.
pub const META_WEIGHT: &str = "weight";

/// Scheme recorded for bare `host:port` addresses.
pub const DEFAULT_SCHEME: &str = "tcp";

/// Deterministic instance identifier: `service#host:port`.
///
/// Registering the same endpoint twice yields the same ID, so the registry
/// overwrites the entry instead of duplicating it.
pub fn instance_id(service_name: &str, host: &str, port: u16) -> InstanceId {
    format!("{}#{}:{}", service_name, host, port)
}

/// Health check identifier derived from the instance it guards.
pub fn check_id(instance_id: &str) -> String {
    format!("{}#check", instance_id)
}

/// A parsed service address.
///
/// Accepts either a URL (`ws://10.0.0.5:9090`) or a bare `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(addr: &str) -> Result<Self> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(RegcacheError::InvalidAddress("address is empty".to_string()));
        }

        if addr.contains("://") {
            let url = Url::parse(addr)?;
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| RegcacheError::InvalidAddress(format!("{}: missing host", addr)))?;
            let port = url
                .port_or_known_default()
                .ok_or_else(|| RegcacheError::InvalidAddress(format!("{}: missing port", addr)))?;
            return Ok(Self {
                scheme: url.scheme().to_string(),
                host: host.to_string(),
                port,
            });
        }

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| RegcacheError::InvalidAddress(format!("{}: expected host:port", addr)))?;
        if host.is_empty() {
            return Err(RegcacheError::InvalidAddress(format!("{}: missing host", addr)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| RegcacheError::InvalidAddress(format!("{}: bad port: {}", addr, e)))?;

        Ok(Self {
            scheme: DEFAULT_SCHEME.to_string(),
            host: host.to_string(),
            port,
        })
    }

    pub fn instance_id(&self, service_name: &str) -> InstanceId {
        instance_id(service_name, &self.host, self.port)
    }

    /// `tcp` endpoint on this machine's advertised host; see
    /// [`local_host`](crate::host::local_host).
    pub fn local(port: u16) -> Option<Self> {
        crate::host::local_host().map(|host| Self {
            scheme: DEFAULT_SCHEME.to_string(),
            host,
            port,
        })
    }
}

/// HTTP health check descriptor attached to a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub check_id: String,
    pub name: String,
    /// URL the registry polls
    pub http: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Registry drops the instance after being critical this long
    pub deregister_after: Duration,
}

impl HealthCheck {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DEFAULT_DEREGISTER_AFTER: Duration = Duration::from_secs(30);

    pub fn new(instance_id: &str, service_name: &str, http: impl Into<String>) -> Self {
        Self {
            check_id: check_id(instance_id),
            name: format!("{}-check", service_name),
            http: http.into(),
            interval: Self::DEFAULT_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
            deregister_after: Self::DEFAULT_DEREGISTER_AFTER,
        }
    }

    pub fn with_timings(mut self, interval: Duration, timeout: Duration, deregister_after: Duration) -> Self {
        self.interval = interval;
        self.timeout = timeout;
        self.deregister_after = deregister_after;
        self
    }

    /// Checks `deregister_after > interval > timeout > 0` and a non-empty target.
    pub fn validate(&self) -> Result<()> {
        if self.http.trim().is_empty() {
            return Err(RegcacheError::InvalidHealthCheck(format!(
                "{}: empty HTTP target",
                self.check_id
            )));
        }
        if self.timeout.is_zero() {
            return Err(RegcacheError::InvalidHealthCheck(format!(
                "{}: timeout must be positive",
                self.check_id
            )));
        }
        if self.interval <= self.timeout {
            return Err(RegcacheError::InvalidHealthCheck(format!(
                "{}: interval {:?} must exceed timeout {:?}",
                self.check_id, self.interval, self.timeout
            )));
        }
        if self.deregister_after <= self.interval {
            return Err(RegcacheError::InvalidHealthCheck(format!(
                "{}: deregister_after {:?} must exceed interval {:?}",
                self.check_id, self.deregister_after, self.interval
            )));
        }
        Ok(())
    }
}

/// One addressable deployment of a named service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,
    pub service_name: ServiceName,
    /// Host part only, no scheme or port
    pub address: String,
    pub port: u16,
    pub tags: BTreeSet<String>,
    pub meta: Metadata,
    pub check: Option<HealthCheck>,
}

impl Instance {
    /// Creates an instance with its ID derived from name, host and port.
    pub fn new(service_name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let service_name = service_name.into();
        let address = address.into();
        Self {
            id: instance_id(&service_name, &address, port),
            service_name,
            address,
            port,
            tags: BTreeSet::new(),
            meta: Metadata::new(),
            check: None,
        }
    }

    /// Sets the metadata and derives the tag set from its values.
    pub fn with_meta(mut self, meta: Metadata) -> Self {
        self.tags = meta.values().cloned().collect();
        self.meta = meta;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// `host:port`, the string callers dial.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn zone(&self) -> Option<&str> {
        self.meta.get(META_ZONE).map(String::as_str)
    }

    /// True when every tag in `wanted` is present. Empty `wanted` matches.
    pub fn has_tags<S: AsRef<str>>(&self, wanted: &[S]) -> bool {
        wanted.iter().all(|t| self.tags.contains(t.as_ref()))
    }

    /// Selection weight from the `weight` metadata key; absent or unparsable
    /// values count as 1.
    pub fn weight(&self) -> i64 {
        self.meta
            .get(META_WEIGHT)
            .and_then(|w| w.trim().parse::<i64>().ok())
            .unwrap_or(1)
    }
}
