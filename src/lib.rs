//! graphpool - topology-aware connection pooling for clustered graph databases
//!
//! A client keeps one pool per cluster instance, routes each request to an
//! instance through a selection strategy and follows membership changes
//! pushed by a refresh agent that polls the cluster topology.
pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod pool;
pub mod refresh;
pub mod strategy;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::info;

pub use crate::client::{AcquireSettings, ClientBuilder, ClientState, TopologyAwareClient};
pub use crate::config::Config;
pub use crate::core::{ClusterTopology, Endpoint, EndpointSelector, EndpointSet};
pub use crate::error::{ConfigError, PoolError, PoolResult, TransportError};
pub use crate::refresh::{RefreshAgent, RefreshTask};
pub use crate::transport::{RequestMessage, TransportFactory};

use crate::metrics::{spawn_metrics_publisher, LoggingMetricsHandler, PoolMetrics};

/// A client wired to its refresh agent and metrics publisher from a [`Config`]
pub struct GraphPool {
    config: Config,
    agent: RefreshAgent,
    client: TopologyAwareClient,
    metrics_task: Option<JoinHandle<()>>,
}

impl GraphPool {
    /// Start over plain TCP connections
    pub async fn start(config: Config) -> PoolResult<Self> {
        let factory = Arc::new(config.client.transport_factory());
        Self::start_with_factory(config, factory).await
    }

    pub async fn start_with_factory(
        config: Config,
        factory: Arc<dyn TransportFactory>,
    ) -> PoolResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| PoolError::internal(format!("No tokio runtime available: {}", e)))?;

        let selector = config.refresh.selector;
        let agent = RefreshAgent::new(config.refresh.fetcher(), runtime.clone());
        let endpoints = agent.get_endpoints(selector, false).await?;

        let metrics = Arc::new(PoolMetrics::new(config.metrics.max_trace_ids));
        let client = TopologyAwareClient::builder(factory)
            .name(format!("graphpool-{}", selector))
            .filter(config.filter.build())
            .strategy(config.strategy.build())
            .settings(config.client.acquire_settings())
            .eager_refresh(agent.provider(selector))
            .metrics(Arc::clone(&metrics))
            .runtime(runtime.clone())
            .build(endpoints)
            .await?;

        agent.start_polling(
            vec![RefreshTask::new(client.clone(), selector)],
            config.refresh.interval(),
        )?;

        let metrics_task = if config.metrics.enabled {
            Some(spawn_metrics_publisher(
                metrics,
                Arc::new(LoggingMetricsHandler),
                config.metrics.publish_interval(),
                &runtime,
            ))
        } else {
            None
        };

        info!(
            "graphpool started: selector {}, {} endpoints pooled",
            selector,
            client.current_endpoints().len()
        );

        Ok(Self {
            config,
            agent,
            client,
            metrics_task,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &TopologyAwareClient {
        &self.client
    }

    pub fn agent(&self) -> &RefreshAgent {
        &self.agent
    }

    /// Stop refreshing and publishing, then close every pool
    pub async fn shutdown(&mut self) {
        self.agent.stop();
        if let Some(task) = self.metrics_task.take() {
            task.abort();
        }
        self.client.close().await;
        info!("graphpool shut down");
    }
}

impl Drop for GraphPool {
    fn drop(&mut self) {
        if let Some(task) = self.metrics_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologySourceConfig;
    use crate::testing::{Behaviour, MockFactory};

    fn static_config(instances: &[&str]) -> Config {
        let mut config = Config::default();
        config.refresh.source = TopologySourceConfig::Static {
            cluster_endpoint: "cluster:8182".to_string(),
            reader_endpoint: "reader:8182".to_string(),
            instances: instances.iter().map(|i| i.to_string()).collect(),
        };
        config.metrics.enabled = true;
        config
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let factory = MockFactory::new(Behaviour::Usable);
        let mut pool = GraphPool::start_with_factory(static_config(&["a:1", "b:1"]), factory.clone())
            .await
            .unwrap();

        assert!(pool.agent().is_running());
        assert_eq!(
            pool.client().current_endpoints().addresses(),
            vec!["a:1", "b:1"]
        );

        let request = RequestMessage::new("g.V().count()");
        let connection = pool.client().acquire(&request).await.unwrap();
        pool.client()
            .complete_request(request.trace_id(), std::time::Duration::from_millis(3));
        assert_eq!(connection.address(), "a:1");

        pool.shutdown().await;
        assert!(!pool.agent().is_running());
        assert_eq!(pool.client().state(), ClientState::Closed);
        assert_eq!(factory.transport("a:1").unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_primary_selector_falls_back_to_cluster_endpoint() {
        let mut config = static_config(&["a:1"]);
        config.refresh.selector = EndpointSelector::Primary;

        let factory = MockFactory::new(Behaviour::Usable);
        let mut pool = GraphPool::start_with_factory(config, factory).await.unwrap();

        assert_eq!(
            pool.client().current_endpoints().addresses(),
            vec!["cluster:8182"]
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = static_config(&["a:1"]);
        config.client.max_wait_ms = 0;

        let result = GraphPool::start_with_factory(config, MockFactory::new(Behaviour::Usable)).await;
        assert!(matches!(
            result,
            Err(PoolError::Config(ConfigError::ValidationError(_)))
        ));
    }
}
