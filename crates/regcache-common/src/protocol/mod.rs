pub mod catalog;
pub mod error;
pub mod health;
pub mod instance;

pub use catalog::{CatalogEntry, CatalogServices};
pub use error::{RegcacheError, Result};
pub use health::{HealthStatus, InstanceHealth, ServiceHealth};
pub use instance::{
    check_id, instance_id, Endpoint, HealthCheck, Instance, InstanceId, Metadata, ServiceName,
    DEFAULT_SCHEME, META_ENV, META_SCHEME, META_WEIGHT, META_ZONE,
};
