//! Cluster membership: which shard lives on which host, and the per-host
//! work queue consumed while a task runs.

pub mod clustered;
pub mod node_map;

pub use clustered::{ClusterItem, ClusteredObservation, ObservationError};
pub use node_map::NodeCommandMap;
