/// Topology fetchers
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::TopologyFetcher;
use crate::core::ClusterTopology;
use crate::error::PoolResult;

/// Always answers with the same topology
#[derive(Debug, Clone)]
pub struct StaticTopology {
    topology: ClusterTopology,
}

impl StaticTopology {
    pub fn new(topology: ClusterTopology) -> Self {
        Self { topology }
    }
}

#[async_trait]
impl TopologyFetcher for StaticTopology {
    async fn fetch_topology(&self, _force_refresh: bool) -> PoolResult<ClusterTopology> {
        Ok(self.topology.clone())
    }
}

/// Reads a JSON topology document from disk on every fetch, so an external
/// process can update the file in place.
#[derive(Debug, Clone)]
pub struct FileTopology {
    path: PathBuf,
}

impl FileTopology {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TopologyFetcher for FileTopology {
    async fn fetch_topology(&self, _force_refresh: bool) -> PoolResult<ClusterTopology> {
        let document = tokio::fs::read_to_string(&self.path).await?;
        let topology = ClusterTopology::from_json(&document)?;
        debug!(
            "Read topology with {} instances from {}",
            topology.instances().len(),
            self.path.display()
        );
        Ok(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Endpoint, InstanceRecord, InstanceRole};
    use crate::error::PoolError;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample() -> ClusterTopology {
        ClusterTopology::new(
            Endpoint::new("cluster:8182"),
            Endpoint::new("reader:8182"),
            vec![
                InstanceRecord::new("w-1", InstanceRole::Writer, "w-1:8182"),
                InstanceRecord::new("r-1", InstanceRole::Reader, "r-1:8182"),
            ],
        )
    }

    #[tokio::test]
    async fn test_static_topology() {
        let fetcher = StaticTopology::new(sample());
        assert_eq!(fetcher.fetch_topology(true).await.unwrap(), sample());
    }

    #[tokio::test]
    async fn test_file_topology_reads_document() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(sample().to_json().unwrap().as_bytes()).unwrap();

        let fetcher = FileTopology::new(file.path());
        assert_eq!(fetcher.fetch_topology(false).await.unwrap(), sample());
    }

    #[tokio::test]
    async fn test_file_topology_errors() {
        let missing = FileTopology::new("/nonexistent/topology.json");
        assert!(matches!(
            missing.fetch_topology(false).await,
            Err(PoolError::Io(_))
        ));

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let invalid = FileTopology::new(file.path());
        assert!(matches!(
            invalid.fetch_topology(false).await,
            Err(PoolError::Serialization(_))
        ));
    }
}
