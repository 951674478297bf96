//! Registry transports
//!
//! Concrete [`RegistryClient`](crate::registry::RegistryClient)
//! implementations. The cache and selector never name these types directly;
//! they are chosen once at startup and injected as a trait object.

pub mod consul;

pub use consul::ConsulAgentClient;
