/// Cluster topology snapshots and their JSON document form
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::endpoint::{annotations, Endpoint};
use crate::error::PoolResult;

/// Status string reported for instances that can serve traffic
pub const STATUS_AVAILABLE: &str = "available";

/// Role of a database instance within the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    Writer,
    Reader,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRole::Writer => write!(f, "writer"),
            InstanceRole::Reader => write!(f, "reader"),
            InstanceRole::Unknown => write!(f, "unknown"),
        }
    }
}

/// One database instance as reported by the topology service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub instance_id: String,
    #[serde(default)]
    pub role: InstanceRole,
    /// Older topology documents name this field `endpoint`
    #[serde(alias = "endpoint")]
    pub address: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub availability_zone: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl InstanceRecord {
    pub fn new<I: Into<String>, A: Into<String>>(
        instance_id: I,
        role: InstanceRole,
        address: A,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            role,
            address: address.into(),
            status: STATUS_AVAILABLE.to_string(),
            availability_zone: String::new(),
            instance_type: String::new(),
            tags: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_status<S: Into<String>>(mut self, status: S) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_availability_zone<S: Into<String>>(mut self, zone: S) -> Self {
        self.availability_zone = zone.into();
        self
    }

    pub fn with_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn is_available(&self) -> bool {
        self.status.eq_ignore_ascii_case(STATUS_AVAILABLE)
    }

    pub fn is_writer(&self) -> bool {
        self.role == InstanceRole::Writer
    }

    pub fn is_reader(&self) -> bool {
        self.role == InstanceRole::Reader
    }

    /// Endpoint for this instance. Instance annotations are copied verbatim;
    /// id, role, status and zone are added unless an annotation of the same
    /// key already exists.
    pub fn to_endpoint(&self) -> Endpoint {
        let mut endpoint = Endpoint::new(self.address.clone());
        for (key, value) in &self.annotations {
            endpoint.annotate(key.clone(), value.clone());
        }

        let derived = [
            (annotations::INSTANCE_ID, self.instance_id.clone()),
            (annotations::ROLE, self.role.to_string()),
            (annotations::STATUS, self.status.clone()),
            (annotations::AVAILABILITY_ZONE, self.availability_zone.clone()),
        ];
        for (key, value) in derived {
            if endpoint.annotation(key).is_none() && !value.is_empty() {
                endpoint.annotate(key, value);
            }
        }

        endpoint
    }
}

/// Point-in-time description of cluster membership and roles.
///
/// Snapshots are immutable once built; a refresh produces a new snapshot
/// rather than editing the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    #[serde(default)]
    instances: Vec<InstanceRecord>,
    cluster_endpoint: Endpoint,
    reader_endpoint: Endpoint,
}

impl ClusterTopology {
    pub fn new(
        cluster_endpoint: Endpoint,
        reader_endpoint: Endpoint,
        instances: Vec<InstanceRecord>,
    ) -> Self {
        Self {
            instances,
            cluster_endpoint,
            reader_endpoint,
        }
    }

    /// Snapshot for a statically configured cluster. Every instance is
    /// available with an unknown role, so role-based selectors fall back to
    /// the cluster and reader endpoints.
    pub fn from_static_list<S: AsRef<str>>(
        cluster_address: &str,
        reader_address: &str,
        instance_addresses: &[S],
    ) -> Self {
        let instances = instance_addresses
            .iter()
            .enumerate()
            .map(|(index, address)| {
                InstanceRecord::new(
                    format!("static-{}", index),
                    InstanceRole::Unknown,
                    address.as_ref(),
                )
            })
            .collect();

        Self::new(
            Endpoint::new(cluster_address),
            Endpoint::new(reader_address),
            instances,
        )
    }

    pub fn cluster_endpoint(&self) -> &Endpoint {
        &self.cluster_endpoint
    }

    pub fn reader_endpoint(&self) -> &Endpoint {
        &self.reader_endpoint
    }

    pub fn instances(&self) -> &[InstanceRecord] {
        &self.instances
    }

    pub fn available_instances(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances.iter().filter(|i| i.is_available())
    }

    pub fn primary_instances(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.available_instances().filter(|i| i.is_writer())
    }

    pub fn reader_instances(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.available_instances().filter(|i| i.is_reader())
    }

    /// Parse the JSON topology document
    pub fn from_json(document: &str) -> PoolResult<Self> {
        Ok(serde_json::from_str(document)?)
    }

    /// Compact JSON topology document
    pub fn to_json(&self) -> PoolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> PoolResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
