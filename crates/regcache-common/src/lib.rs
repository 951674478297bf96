//! regcache Common Types and Transport
//!
//! Shared building blocks for the regcache service-registry client:
//!
//! - **Protocol**: [`Instance`], [`HealthCheck`], deterministic instance IDs,
//!   health lookup results and the [`RegcacheError`] taxonomy
//! - **Registry capability**: the [`RegistryClient`] trait every backend implements
//! - **Configuration**: [`RegistryConfig`], read from `CONSUL_*` environment variables
//! - **Transport**: [`ConsulAgentClient`], a Consul agent HTTP implementation,
//!   plus its filtered and catalog queries
//! - **Host**: [`local_host`], the name this process advertises
//!
//! # Example
//!
//! ```no_run
//! use regcache_common::{ConsulAgentClient, RegistryClient, RegistryConfig};
//!
//! # async fn run() -> regcache_common::Result<()> {
//! let config = RegistryConfig::from_env();
//! let client = ConsulAgentClient::new(&config);
//! let instances = client.list_instances().await?;
//! println!("{} instances known", instances.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod host;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use config::RegistryConfig;
pub use host::local_host;
pub use protocol::*;
pub use registry::{RegistryClient, SharedRegistryClient};
pub use transport::ConsulAgentClient;
