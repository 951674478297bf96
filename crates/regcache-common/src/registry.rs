//! Registry capability
//!
//! The cache, selector and registration manager only ever talk to the
//! registry through [`RegistryClient`]. The crate ships one implementation,
//! [`ConsulAgentClient`](crate::transport::ConsulAgentClient); tests plug in
//! in-memory fakes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{Instance, InstanceId, Result, ServiceHealth};

/// Operations the registry must support.
///
/// Implementations own their timeouts; callers add none on top.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Returns the full current membership keyed by instance ID.
    async fn list_instances(&self) -> Result<HashMap<InstanceId, Instance>>;

    /// Registers or overwrites an instance (keyed by `instance.id`).
    async fn register(&self, instance: &Instance) -> Result<()>;

    /// Removes an instance. Unknown IDs yield `RegcacheError::ServiceNotFound`.
    async fn deregister(&self, instance_id: &str) -> Result<()>;

    /// Aggregated health for every instance of `service_name`.
    async fn lookup_health(&self, service_name: &str) -> Result<ServiceHealth>;
}

pub type SharedRegistryClient = Arc<dyn RegistryClient>;
