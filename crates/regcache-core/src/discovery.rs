use std::sync::{Arc, OnceLock};

use regcache_common::protocol::{
    Instance, InstanceId, Metadata, RegcacheError, Result, ServiceHealth,
};
use regcache_common::{ConsulAgentClient, RegistryConfig, SharedRegistryClient};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::health_endpoint::HealthEndpoint;
use crate::random::RandomSource;
use crate::refresher::SnapshotRefresher;
use crate::registration::{DrainSummary, HealthTarget, RegistrationManager};
use crate::selector::{InstanceQuery, InstanceSelector};
use crate::shutdown::{
    DrainReport, ShutdownCoordinator, ShutdownPhase, ShutdownProgress, ShutdownSignal,
};
use crate::snapshot::{RegistrySnapshot, SnapshotState};

/// Process-wide service discovery.
///
/// `Discovery` owns every piece of client-side registry state: the shared
/// random source, the membership snapshot, the registration manager and the
/// shutdown coordinator. All of them talk to the registry through one
/// injected [`RegistryClient`](regcache_common::RegistryClient).
///
/// # Lifecycle
///
/// 1. Build with [`Discovery::new`] (or [`Discovery::from_env`])
/// 2. [`start`](Discovery::start) the background tasks
/// 3. [`register`](Discovery::register) this process's endpoints
/// 4. Serve traffic, picking targets with the `by_*` / `select_*` methods
/// 5. [`shutdown`](Discovery::shutdown) (or `run_until_signal`) to deregister
///
/// `start` installs the SIGTERM/SIGINT/SIGQUIT handlers before anything is
/// registered. A signal drains in the background from then on, whatever the
/// caller is doing.
///
/// Selection never calls the registry. It reads the last published
/// snapshot, which may be stale if the registry is unreachable.
pub struct Discovery {
    config: RegistryConfig,
    client: SharedRegistryClient,
    random: Arc<RandomSource>,
    snapshot: Arc<RegistrySnapshot>,
    selector: InstanceSelector,
    registration: Arc<RegistrationManager>,
    coordinator: Arc<ShutdownCoordinator>,
    progress: OnceLock<ShutdownProgress>,
    bind_health_endpoint: bool,
    listen_for_signals: bool,
}

/// Handles to the tasks started by [`Discovery::start`].
pub struct DiscoveryHandles {
    pub refresher: JoinHandle<()>,
    pub drain_participant: JoinHandle<()>,
    pub signal_listener: Option<JoinHandle<()>>,
    pub health: Option<HealthEndpoint>,
    progress: Option<ShutdownProgress>,
    shutdown_tx: watch::Sender<bool>,
}

impl DiscoveryHandles {
    pub fn health_port(&self) -> Option<u16> {
        self.health.as_ref().map(HealthEndpoint::port)
    }

    /// Stops the refresher and the health endpoint, waiting for the
    /// refresher to exit. A signal-driven drain already under way is
    /// awaited, not cut short.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(health) = self.health {
            health.shutdown();
        }
        if let Err(e) = self.refresher.await {
            if e.is_panic() {
                error!("Snapshot refresher panicked: {}", e);
            }
        }
        self.drain_participant.abort();
        if let Some(listener) = self.signal_listener {
            let draining = self
                .progress
                .as_ref()
                .is_some_and(|progress| matches!(progress.phase(), ShutdownPhase::Draining(_)));
            if draining {
                let _ = listener.await;
            } else {
                listener.abort();
            }
        }
    }
}

impl Discovery {
    /// Creates a discovery client around `client`.
    ///
    /// # Arguments
    /// * `client` - Registry transport
    /// * `config` - Timing, zone and environment settings
    ///
    /// # Returns
    /// An idle `Discovery`; nothing runs until [`start`](Self::start).
    pub fn new(client: SharedRegistryClient, config: RegistryConfig) -> Self {
        Self::with_random_source(client, config, Arc::new(RandomSource::new()))
    }

    /// Like [`new`](Self::new) but with a caller-supplied random source,
    /// for reproducible selection in tests.
    pub fn with_random_source(
        client: SharedRegistryClient,
        config: RegistryConfig,
        random: Arc<RandomSource>,
    ) -> Self {
        let snapshot = Arc::new(RegistrySnapshot::new(config.snapshot_ttl));
        let selector = InstanceSelector::new(Arc::clone(&snapshot), Arc::clone(&random));
        let registration = Arc::new(RegistrationManager::new(Arc::clone(&client), &config));
        let coordinator = Arc::new(ShutdownCoordinator::new(config.drain_timeout));

        Self {
            config,
            client,
            random,
            snapshot,
            selector,
            registration,
            coordinator,
            progress: OnceLock::new(),
            bind_health_endpoint: true,
            listen_for_signals: true,
        }
    }

    /// Reads [`RegistryConfig`] from the environment and talks to the
    /// Consul agent it names.
    pub fn from_env() -> Result<Self> {
        let config = RegistryConfig::from_env();
        config.validate()?;
        let client: SharedRegistryClient = Arc::new(ConsulAgentClient::new(&config));
        Ok(Self::new(client, config))
    }

    /// Skips binding the default health endpoint in [`start`](Self::start).
    /// Registrations must then use explicit health URLs.
    pub fn without_health_endpoint(mut self) -> Self {
        self.bind_health_endpoint = false;
        self
    }

    /// Skips installing signal handlers in [`start`](Self::start). Shutdown
    /// then happens only through [`shutdown`](Self::shutdown).
    pub fn without_signal_listener(mut self) -> Self {
        self.listen_for_signals = false;
        self
    }

    /// Starts the background tasks.
    ///
    /// # Behavior
    /// - Binds the health endpoint (unless disabled) and records its port
    /// - Spawns the snapshot refresher; its first refresh runs immediately
    /// - Registers the registration manager as a shutdown participant
    /// - Installs the signal handlers and spawns the task that drains on a
    ///   signal (unless disabled)
    pub async fn start(&self) -> Result<DiscoveryHandles> {
        self.config.validate()?;

        let health = if self.bind_health_endpoint {
            let endpoint = HealthEndpoint::bind(self.config.health_port_range.clone(), &self.random).await?;
            self.registration.set_health_port(endpoint.port());
            Some(endpoint)
        } else {
            None
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let refresher = SnapshotRefresher::new(
            Arc::clone(&self.snapshot),
            Arc::clone(&self.client),
            self.config.refresh_interval,
        )
        .with_shutdown(shutdown_rx)
        .spawn();

        let drain_participant = self.registration.spawn_drain_participant(&self.coordinator);

        let (signal_listener, progress) = if self.listen_for_signals {
            let (handle, progress) = self.coordinator.spawn_signal_listener()?;
            let _ = self.progress.set(progress.clone());
            (Some(handle), Some(progress))
        } else {
            (None, None)
        };

        info!(
            "Discovery started (zone {}, env {}, refresh every {:?})",
            self.config.zone, self.config.environment, self.config.refresh_interval
        );

        Ok(DiscoveryHandles {
            refresher,
            drain_participant,
            signal_listener,
            health,
            progress,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn snapshot(&self) -> &Arc<RegistrySnapshot> {
        &self.snapshot
    }

    pub fn selector(&self) -> &InstanceSelector {
        &self.selector
    }

    pub fn registration(&self) -> &Arc<RegistrationManager> {
        &self.registration
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    pub fn snapshot_state(&self) -> SnapshotState {
        self.snapshot.state()
    }

    /// Refreshes the snapshot once, outside the timer.
    pub async fn refresh(&self) -> Result<usize> {
        self.snapshot.refresh(self.client.as_ref()).await
    }

    /// Registers `service_name` at each address.
    ///
    /// # Arguments
    /// * `service_name` - Logical service name
    /// * `health` - Health target; see [`HealthTarget`]
    /// * `metadata` - Extra metadata, overriding `scheme`/`zone`/`env`
    /// * `addresses` - URLs (`ws://10.0.0.5:9090`) or bare `host:port`
    ///
    /// # Returns
    /// The registered instance IDs
    pub async fn register<S: AsRef<str>>(
        &self,
        service_name: &str,
        health: &HealthTarget,
        metadata: &Metadata,
        addresses: &[S],
    ) -> Result<Vec<InstanceId>> {
        self.registration
            .register(service_name, health, metadata, addresses)
            .await
    }

    pub async fn deregister(&self, service_name: &str, address: &str) -> Result<()> {
        self.registration.deregister(service_name, address).await
    }

    pub fn by_name(&self, name: &str) -> Vec<Instance> {
        self.selector.by_name(name)
    }

    pub fn by_name_and_zone(&self, name: &str, zone: &str) -> Vec<Instance> {
        self.selector.by_name_and_zone(name, zone)
    }

    pub fn by_name_and_tags<S: AsRef<str>>(&self, name: &str, tags: &[S]) -> Vec<Instance> {
        self.selector.by_name_and_tags(name, tags)
    }

    pub fn by_query(&self, query: &InstanceQuery) -> Vec<Instance> {
        self.selector.by_query(query)
    }

    pub fn addrs_by_name(&self, name: &str) -> Vec<String> {
        self.selector.addrs_by_name(name)
    }

    pub fn addrs_by_name_and_zone(&self, name: &str, zone: &str) -> Vec<String> {
        self.selector.addrs_by_name_and_zone(name, zone)
    }

    pub fn addrs_by_name_and_tags<S: AsRef<str>>(&self, name: &str, tags: &[S]) -> Vec<String> {
        self.selector.addrs_by_name_and_tags(name, tags)
    }

    pub fn select_one<'a>(&self, candidates: &'a [Instance]) -> Option<&'a Instance> {
        self.selector.select_one(candidates)
    }

    pub fn select_weighted<'a>(&self, candidates: &'a [Instance]) -> Option<&'a Instance> {
        self.selector.select_weighted(candidates)
    }

    /// Host this process advertises: `$HOSTNAME`, else its `10.x` address.
    pub fn local_host(&self) -> Option<String> {
        regcache_common::local_host()
    }

    /// Asks the registry directly; not served from the snapshot.
    pub async fn lookup_health(&self, service_name: &str) -> Result<ServiceHealth> {
        self.client.lookup_health(service_name).await
    }

    /// Deregisters everything this process registered, without going
    /// through the coordinator.
    pub async fn deregister_owned(&self) -> DrainSummary {
        self.registration.deregister_owned().await
    }

    /// Drains every shutdown participant.
    pub async fn shutdown(&self) -> DrainReport {
        self.coordinator.drain().await
    }

    /// Resolves on SIGTERM, SIGINT or SIGQUIT.
    pub async fn wait_for_signal(&self) -> Result<ShutdownSignal> {
        match self.progress.get() {
            Some(progress) => progress.signalled().await.ok_or_else(listener_stopped),
            None => crate::shutdown::wait_for_signal().await,
        }
    }

    /// Waits for SIGTERM, SIGINT or SIGQUIT and for the drain that follows.
    ///
    /// After [`start`](Self::start) the drain is the one the signal listener
    /// runs; otherwise handlers are installed here and the drain runs inline.
    pub async fn run_until_signal(&self) -> Result<(ShutdownSignal, DrainReport)> {
        match self.progress.get() {
            Some(progress) => progress.drained().await.ok_or_else(listener_stopped),
            None => self.coordinator.run_until_signal().await,
        }
    }

    /// Shutdown progress of the signal listener, once started.
    pub fn shutdown_progress(&self) -> Option<&ShutdownProgress> {
        self.progress.get()
    }
}

fn listener_stopped() -> RegcacheError {
    RegcacheError::ShuttingDown("signal listener stopped".to_string())
}
