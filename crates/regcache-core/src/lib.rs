//! Registry cache, instance selection and graceful deregistration.
//!
//! Leaves first: [`RandomSource`], [`WeightedSelector`], [`RegistrySnapshot`]
//! with its [`SnapshotRefresher`], the [`InstanceSelector`] pipeline,
//! [`RegistrationManager`] and [`ShutdownCoordinator`]. [`Discovery`] wires
//! them together around one registry client.

pub mod discovery;
pub mod health_endpoint;
pub mod random;
pub mod refresher;
pub mod registration;
pub mod selector;
pub mod shutdown;
pub mod snapshot;
pub mod weighted;

pub use discovery::{Discovery, DiscoveryHandles};
pub use health_endpoint::{HealthEndpoint, PING_BODY, PING_PATH};
pub use random::RandomSource;
pub use refresher::SnapshotRefresher;
pub use registration::{DrainSummary, HealthTarget, RegistrationManager, DEFAULT_HEALTHY};
pub use selector::{InstanceQuery, InstanceSelector};
pub use shutdown::{
    wait_for_signal, DrainListener, DrainReport, DrainRequest, ShutdownCoordinator, ShutdownPhase,
    ShutdownProgress, ShutdownSignal, SignalWatcher,
};
pub use snapshot::{RegistrySnapshot, SnapshotState, SnapshotView};
pub use weighted::{PresummedList, TotalWeight, WeightedItem, WeightedList, WeightedSelector};
