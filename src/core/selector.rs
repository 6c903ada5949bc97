/// Endpoint selectors: pure mappings from a topology snapshot to the
/// endpoints a client should pool.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::endpoint::EndpointSet;
use super::topology::ClusterTopology;

/// Which part of the cluster a client talks to.
///
/// `Primary` and `ReadReplicas` fall back to the cluster and reader endpoints
/// respectively when the snapshot lists no available instance of that role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSelector {
    /// The cluster-level (writer) address
    ClusterEndpoint,
    /// The cluster-level reader address
    ReaderEndpoint,
    /// Every available instance regardless of role
    All,
    /// Available writer instances
    Primary,
    /// Available reader instances
    ReadReplicas,
}

impl EndpointSelector {
    pub const ALL_VARIANTS: [EndpointSelector; 5] = [
        EndpointSelector::ClusterEndpoint,
        EndpointSelector::ReaderEndpoint,
        EndpointSelector::All,
        EndpointSelector::Primary,
        EndpointSelector::ReadReplicas,
    ];

    /// Apply the selector to a snapshot
    pub fn apply(self, topology: &ClusterTopology) -> EndpointSet {
        match self {
            EndpointSelector::ClusterEndpoint => {
                std::iter::once(topology.cluster_endpoint().clone()).collect()
            }
            EndpointSelector::ReaderEndpoint => {
                std::iter::once(topology.reader_endpoint().clone()).collect()
            }
            EndpointSelector::All => topology
                .available_instances()
                .map(|instance| instance.to_endpoint())
                .collect(),
            EndpointSelector::Primary => {
                let primaries: EndpointSet = topology
                    .primary_instances()
                    .map(|instance| instance.to_endpoint())
                    .collect();
                if primaries.is_empty() {
                    EndpointSelector::ClusterEndpoint.apply(topology)
                } else {
                    primaries
                }
            }
            EndpointSelector::ReadReplicas => {
                let readers: EndpointSet = topology
                    .reader_instances()
                    .map(|instance| instance.to_endpoint())
                    .collect();
                if readers.is_empty() {
                    EndpointSelector::ReaderEndpoint.apply(topology)
                } else {
                    readers
                }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EndpointSelector::ClusterEndpoint => "cluster_endpoint",
            EndpointSelector::ReaderEndpoint => "reader_endpoint",
            EndpointSelector::All => "all",
            EndpointSelector::Primary => "primary",
            EndpointSelector::ReadReplicas => "read_replicas",
        }
    }
}

impl Default for EndpointSelector {
    fn default() -> Self {
        EndpointSelector::All
    }
}

impl fmt::Display for EndpointSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EndpointSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        EndpointSelector::ALL_VARIANTS
            .iter()
            .copied()
            .find(|selector| selector.name() == normalized)
            .ok_or_else(|| format!("Unknown endpoint selector: {}", s))
    }
}
