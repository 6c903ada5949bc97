/// Endpoints and deduplicated endpoint sets
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::filter::{Approval, EndpointFilter};

/// Well-known annotation keys written by selectors and filters
pub mod annotations {
    /// Lifecycle marker, e.g. `suspended`
    pub const STATE: &str = "state";
    /// Value of [`STATE`] for endpoints taken out of rotation
    pub const SUSPENDED: &str = "suspended";
    /// Instance status copied from the topology snapshot
    pub const STATUS: &str = "status";
    /// Instance role copied from the topology snapshot
    pub const ROLE: &str = "role";
    /// Instance id copied from the topology snapshot
    pub const INSTANCE_ID: &str = "instanceId";
    /// Availability zone copied from the topology snapshot
    pub const AVAILABILITY_ZONE: &str = "availabilityZone";
    /// Reason attached to an endpoint the filter rejected
    pub const REJECTED_REASON: &str = "rejectedReason";
}

/// Well-known metric keys read by the load-weighted strategy
pub mod metrics {
    /// CPU utilization in percent (0..=100)
    pub const CPU_UTILIZATION: &str = "cpuUtilization";
    /// Number of requests waiting in the server-side queue
    pub const QUEUE_DEPTH: &str = "queueDepth";
}

/// A single network address of the cluster: one instance, or a cluster-level
/// address such as the writer or reader endpoint.
///
/// Identity is the address alone. Annotations and metrics may be changed by
/// filters without affecting equality or hashing.
#[derive(Clone, Serialize, Deserialize)]
pub struct Endpoint {
    address: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metrics: BTreeMap<String, f64>,
}

impl Endpoint {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            annotations: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_annotation<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.annotate(key, value);
        self
    }

    pub fn with_metric<K: Into<String>>(mut self, key: K, value: f64) -> Self {
        self.set_metric(key, value);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn annotate<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.annotations.insert(key.into(), value.into());
    }

    pub fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }

    pub fn set_metric<K: Into<String>>(&mut self, key: K, value: f64) {
        self.metrics.insert(key.into(), value);
    }

    /// Whether the address is blank and cannot be connected to
    pub fn is_blank(&self) -> bool {
        self.address.trim().is_empty()
    }

    pub fn is_suspended(&self) -> bool {
        self.annotation(annotations::STATE) == Some(annotations::SUSPENDED)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Endpoint");
        dbg.field("address", &self.address);
        if !self.annotations.is_empty() {
            dbg.field("annotations", &self.annotations);
        }
        if !self.metrics.is_empty() {
            dbg.field("metrics", &self.metrics);
        }
        dbg.finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// A set of endpoints keyed by address. Inserting an endpoint whose address
/// is already present replaces the previous entry. Iteration is ordered by
/// address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointSet {
    endpoints: BTreeMap<String, Endpoint>,
}

/// Result of running an endpoint set through a filter
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub accepted: EndpointSet,
    pub rejected: EndpointSet,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an endpoint, replacing any existing entry with the same address
    pub fn insert(&mut self, endpoint: Endpoint) -> Option<Endpoint> {
        self.endpoints.insert(endpoint.address.clone(), endpoint)
    }

    pub fn remove(&mut self, address: &str) -> Option<Endpoint> {
        self.endpoints.remove(address)
    }

    pub fn get(&self, address: &str) -> Option<&Endpoint> {
        self.endpoints.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.endpoints.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }

    /// Endpoints of both sets; entries of `other` win on duplicate addresses
    pub fn union(&self, other: &EndpointSet) -> EndpointSet {
        let mut merged = self.clone();
        for endpoint in other.iter() {
            merged.insert(endpoint.clone());
        }
        merged
    }

    /// Endpoints present in `self` but absent from `other`
    pub fn difference(&self, other: &EndpointSet) -> EndpointSet {
        self.iter()
            .filter(|endpoint| !other.contains(endpoint.address()))
            .cloned()
            .collect()
    }

    /// Enrich every endpoint through `filter` and split the result into
    /// accepted and rejected endpoints. Rejected endpoints carry their reason
    /// in the `rejectedReason` annotation.
    pub fn partition(self, filter: &dyn EndpointFilter) -> Partition {
        let mut partition = Partition::default();

        for endpoint in self.endpoints.into_values() {
            let mut endpoint = filter.enrich(endpoint);
            match filter.approve(&endpoint) {
                Approval::Accepted => {
                    partition.accepted.insert(endpoint);
                }
                Approval::Rejected { reason } => {
                    endpoint.annotate(annotations::REJECTED_REASON, reason);
                    partition.rejected.insert(endpoint);
                }
            }
        }

        partition
    }
}

impl FromIterator<Endpoint> for EndpointSet {
    fn from_iter<I: IntoIterator<Item = Endpoint>>(iter: I) -> Self {
        let mut set = EndpointSet::new();
        for endpoint in iter {
            set.insert(endpoint);
        }
        set
    }
}

impl IntoIterator for EndpointSet {
    type Item = Endpoint;
    type IntoIter = btree_map::IntoValues<String, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.endpoints.into_values()
    }
}

impl Partition {
    /// Deduplicated rejection reasons of the rejected endpoints
    pub fn rejection_reasons(&self) -> std::collections::BTreeSet<String> {
        self.rejected
            .iter()
            .filter_map(|endpoint| endpoint.annotation(annotations::REJECTED_REASON))
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{EmptyAddressFilter, SuspendedEndpoints};

    fn set_of(addresses: &[&str]) -> EndpointSet {
        addresses.iter().map(|a| Endpoint::new(*a)).collect()
    }

    #[test]
    fn test_endpoint_equality_ignores_annotations() {
        let plain = Endpoint::new("db-1:8182");
        let annotated = Endpoint::new("db-1:8182")
            .with_annotation("state", "suspended")
            .with_metric(metrics::CPU_UTILIZATION, 80.0);

        assert_eq!(plain, annotated);
        assert!(annotated.is_suspended());
        assert_eq!(annotated.metric(metrics::CPU_UTILIZATION), Some(80.0));
    }

    #[test]
    fn test_endpoint_set_last_write_wins() {
        let mut set = EndpointSet::new();
        set.insert(Endpoint::new("db-1:8182").with_annotation("az", "a"));
        set.insert(Endpoint::new("db-1:8182").with_annotation("az", "b"));

        assert_eq!(set.len(), 1);
        assert_eq!(set.get("db-1:8182").unwrap().annotation("az"), Some("b"));
    }

    #[test]
    fn test_union_and_difference() {
        let a = set_of(&["a:1", "b:1", "c:1"]);
        let b = set_of(&["b:1", "d:1"]);

        assert_eq!(a.union(&b).addresses(), vec!["a:1", "b:1", "c:1", "d:1"]);
        assert_eq!(a.difference(&b).addresses(), vec!["a:1", "c:1"]);
        assert_eq!(b.difference(&a).addresses(), vec!["d:1"]);
        assert!(a.difference(&a).is_empty());
    }

    #[test]
    fn test_partition_covers_input_without_overlap() {
        let mut input = set_of(&["a:1", "b:1", "c:1"]);
        input.insert(Endpoint::new("  "));
        let filter = SuspendedEndpoints::new(["b:1"]);
        let chain = crate::filter::FilterChain::new()
            .with(EmptyAddressFilter)
            .with(filter);

        let addresses = input.addresses();
        let partition = input.partition(&chain);

        let accepted = partition.accepted.addresses();
        let rejected = partition.rejected.addresses();
        assert_eq!(accepted, vec!["a:1", "c:1"]);
        assert_eq!(rejected, vec!["  ", "b:1"]);

        let mut all: Vec<String> = accepted.iter().chain(rejected.iter()).cloned().collect();
        all.sort();
        assert_eq!(all, addresses);
        assert!(accepted.iter().all(|a| !rejected.contains(a)));

        assert_eq!(
            partition.rejected.get("b:1").unwrap().annotation(annotations::REJECTED_REASON),
            Some("suspended")
        );
        let reasons: Vec<String> = partition.rejection_reasons().into_iter().collect();
        assert_eq!(reasons, vec!["empty address", "suspended"]);
    }
}
