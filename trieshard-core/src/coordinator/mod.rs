//! Manager coordination engine
//!
//! Cluster registry, heartbeat monitor, split coordinator and the event
//! loop that serializes every change to them.

pub mod events;
pub mod heartbeat;
pub mod manager;
pub mod registry;
pub mod split;

pub use events::{channels, Event, EventReceivers, ManagerHandle};
pub use heartbeat::{AckOutcome, HeartbeatConfig, HeartbeatMonitor};
pub use manager::{Manager, ManagerConfig};
pub use registry::{ClusterRegistry, Reassignment, Registration, Shard, WorkerNode};
pub use split::{AckResolution, SplitConfig, SplitCoordinator, SplitOperation, TargetStrategy};
