//! Instance registration
//!
//! [`RegistrationManager`] turns `(service, address)` pairs into registry
//! entries with deterministic IDs, remembers which IDs this process owns,
//! and sweeps them on shutdown.
//!
//! The first sweep closes the manager. Later registrations are refused, and
//! one already in flight deregisters its instance again when it lands.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use regcache_common::protocol::{
    Endpoint, HealthCheck, Instance, InstanceId, Metadata, RegcacheError, Result, META_ENV,
    META_SCHEME, META_ZONE,
};
use regcache_common::{RegistryConfig, SharedRegistryClient};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::health_endpoint::ping_url;
use crate::shutdown::{DrainListener, ShutdownCoordinator};

/// Health target literal meaning "use the locally bound health endpoint".
pub const DEFAULT_HEALTHY: &str = "default-healthy";

/// Where the registry should poll an instance's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthTarget {
    /// The local [`HealthEndpoint`](crate::HealthEndpoint), at the
    /// instance's host
    Default,
    Url(String),
}

impl HealthTarget {
    /// Maps [`DEFAULT_HEALTHY`] to `Default`, anything else to a URL.
    pub fn parse(s: &str) -> Self {
        if s == DEFAULT_HEALTHY {
            HealthTarget::Default
        } else {
            HealthTarget::Url(s.to_string())
        }
    }
}

/// Result of sweeping the owned instance set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub deregistered: Vec<InstanceId>,
    /// Instance ID and error text
    pub failed: Vec<(InstanceId, String)>,
}

#[derive(Default)]
struct OwnedSet {
    ids: BTreeSet<InstanceId>,
    closed: bool,
}

/// Registers and deregisters this process's instances.
pub struct RegistrationManager {
    client: SharedRegistryClient,
    zone: String,
    environment: String,
    health_port: OnceLock<u16>,
    owned: Mutex<OwnedSet>,
}

impl RegistrationManager {
    pub fn new(client: SharedRegistryClient, config: &RegistryConfig) -> Self {
        Self {
            client,
            zone: config.zone.clone(),
            environment: config.environment.clone(),
            health_port: OnceLock::new(),
            owned: Mutex::new(OwnedSet::default()),
        }
    }

    /// Records the port of the bound health endpoint. Only the first call
    /// takes effect.
    pub fn set_health_port(&self, port: u16) {
        if self.health_port.set(port).is_err() {
            warn!("Health port already set, ignoring {}", port);
        }
    }

    pub fn health_port(&self) -> Option<u16> {
        self.health_port.get().copied()
    }

    fn owned(&self) -> MutexGuard<'_, OwnedSet> {
        self.owned.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Builds the registry entry for one address without registering it.
    pub fn build_instance(
        &self,
        service_name: &str,
        health: &HealthTarget,
        metadata: &Metadata,
        address: &str,
    ) -> Result<Instance> {
        let endpoint = Endpoint::parse(address)?;

        let mut meta = Metadata::new();
        meta.insert(META_SCHEME.to_string(), endpoint.scheme.clone());
        meta.insert(META_ZONE.to_string(), self.zone.clone());
        meta.insert(META_ENV.to_string(), self.environment.clone());
        meta.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));

        let http = match health {
            HealthTarget::Url(url) => url.clone(),
            HealthTarget::Default => {
                let port = self.health_port().ok_or_else(|| {
                    RegcacheError::Configuration(
                        "default health target requested but no health endpoint is bound".to_string(),
                    )
                })?;
                ping_url(&endpoint.host, port)
            }
        };

        let instance = Instance::new(service_name, endpoint.host, endpoint.port).with_meta(meta);
        let check = HealthCheck::new(&instance.id, service_name, http);
        check.validate()?;

        Ok(instance.with_check(check))
    }

    /// Registers `service_name` at every address.
    ///
    /// All addresses are validated before anything is sent. Registration then
    /// stops at the first registry error; addresses registered before it stay
    /// registered and owned.
    pub async fn register<S: AsRef<str>>(
        &self,
        service_name: &str,
        health: &HealthTarget,
        metadata: &Metadata,
        addresses: &[S],
    ) -> Result<Vec<InstanceId>> {
        if service_name.trim().is_empty() {
            return Err(RegcacheError::Configuration("service name is empty".to_string()));
        }
        if addresses.is_empty() {
            return Err(RegcacheError::Configuration(format!(
                "no addresses given for {}",
                service_name
            )));
        }

        let instances = addresses
            .iter()
            .map(|addr| self.build_instance(service_name, health, metadata, addr.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let mut registered = Vec::with_capacity(instances.len());
        for instance in instances {
            if self.is_closed() {
                warn!("Not registering {}: shutdown sweep already ran", instance.id);
                return Err(RegcacheError::ShuttingDown(format!("{} not registered", instance.id)));
            }
            if let Err(e) = self.client.register(&instance).await {
                error!("Failed to register {}: {}", instance.id, e);
                return Err(e);
            }
            debug!("Registered {} at {}", instance.id, instance.endpoint());

            let swept = {
                let mut owned = self.owned();
                if !owned.closed {
                    owned.ids.insert(instance.id.clone());
                }
                owned.closed
            };
            if swept {
                warn!("{} registered after the shutdown sweep, deregistering", instance.id);
                self.deregister_late(&instance.id).await;
                return Err(RegcacheError::ShuttingDown(format!("{} deregistered again", instance.id)));
            }
            registered.push(instance.id);
        }

        info!("Registered {} instance(s) of {}", registered.len(), service_name);
        Ok(registered)
    }

    /// Deregisters one address. Unknown instances are not an error.
    pub async fn deregister(&self, service_name: &str, address: &str) -> Result<()> {
        let id = Endpoint::parse(address)?.instance_id(service_name);
        self.deregister_id(&id).await
    }

    async fn deregister_id(&self, id: &str) -> Result<()> {
        match self.client.deregister(id).await {
            Ok(()) => {
                debug!("Deregistered {}", id);
            }
            Err(RegcacheError::ServiceNotFound(_)) => {
                debug!("{} was not registered", id);
            }
            Err(e) => {
                error!("Failed to deregister {}: {}", id, e);
                return Err(e);
            }
        }
        self.owned().ids.remove(id);
        Ok(())
    }

    async fn deregister_late(&self, id: &str) {
        match self.client.deregister(id).await {
            Ok(()) | Err(RegcacheError::ServiceNotFound(_)) => debug!("Deregistered {}", id),
            Err(e) => error!("Failed to deregister {} during shutdown: {}", id, e),
        }
    }

    /// Deregisters every owned instance once and closes the manager to new
    /// registrations. Failures are logged and collected; the sweep always
    /// visits every ID.
    pub async fn deregister_owned(&self) -> DrainSummary {
        let ids = {
            let mut owned = self.owned();
            owned.closed = true;
            std::mem::take(&mut owned.ids)
        };
        let mut summary = DrainSummary::default();

        for id in ids {
            match self.client.deregister(&id).await {
                Ok(()) | Err(RegcacheError::ServiceNotFound(_)) => summary.deregistered.push(id),
                Err(e) => {
                    error!("Failed to deregister {} during shutdown: {}", id, e);
                    summary.failed.push((id, e.to_string()));
                }
            }
        }

        info!(
            "Shutdown sweep: {} deregistered, {} failed",
            summary.deregistered.len(),
            summary.failed.len()
        );
        summary
    }

    pub fn owned_ids(&self) -> Vec<InstanceId> {
        self.owned().ids.iter().cloned().collect()
    }

    pub fn is_owned(&self, id: &str) -> bool {
        self.owned().ids.contains(id)
    }

    /// True once the shutdown sweep ran.
    pub fn is_closed(&self) -> bool {
        self.owned().closed
    }

    /// Registers with `coordinator` and sweeps owned instances when it drains.
    pub fn spawn_drain_participant(self: &Arc<Self>, coordinator: &ShutdownCoordinator) -> JoinHandle<()> {
        let listener = coordinator.register("registration");
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.serve_drain(listener).await })
    }

    async fn serve_drain(&self, mut listener: DrainListener) {
        let Some(request) = listener.recv().await else {
            return;
        };
        let summary = self.deregister_owned().await;
        if summary.failed.is_empty() {
            request.complete();
        } else {
            request.fail(format!("{} instance(s) not deregistered", summary.failed.len()));
        }
    }
}
