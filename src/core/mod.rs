/// Core entity model shared by pools, strategies and the refresh agent:
/// endpoints, endpoint sets, topology snapshots and selectors.
pub use endpoint::{annotations, metrics, Endpoint, EndpointSet, Partition};
pub use selector::EndpointSelector;
pub use topology::{ClusterTopology, InstanceRecord, InstanceRole, STATUS_AVAILABLE};

pub mod endpoint;
pub mod selector;
pub mod topology;
