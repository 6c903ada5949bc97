/// Topology refresh
///
/// A [`RefreshAgent`] owns a [`TopologyCache`] and, once started, polls the
/// topology source with a fixed delay between runs. Each poll fetches one
/// snapshot, applies every registered selector once and hands the result to
/// the clients registered under that selector.
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ClientState, TopologyAwareClient};
use crate::core::{ClusterTopology, EndpointSelector, EndpointSet};
use crate::error::{ConfigError, PoolError, PoolResult};

pub mod sources;

pub use sources::{FileTopology, StaticTopology};

/// Source of cluster topology snapshots
#[async_trait]
pub trait TopologyFetcher: Send + Sync {
    /// `force_refresh` asks the source to bypass any cache of its own
    async fn fetch_topology(&self, force_refresh: bool) -> PoolResult<ClusterTopology>;
}

/// Source of the endpoint set a client should pool
#[async_trait]
pub trait EndpointsProvider: Send + Sync {
    async fn endpoints(&self, force_refresh: bool) -> PoolResult<EndpointSet>;
}

/// Keeps the last good snapshot.
///
/// A failed fetch is served from the cache when one exists; it only becomes
/// an error before the first successful fetch.
pub struct TopologyCache {
    fetcher: Arc<dyn TopologyFetcher>,
    cached: ArcSwapOption<ClusterTopology>,
}

impl TopologyCache {
    pub fn new(fetcher: Arc<dyn TopologyFetcher>) -> Self {
        Self {
            fetcher,
            cached: ArcSwapOption::empty(),
        }
    }

    pub fn cached(&self) -> Option<Arc<ClusterTopology>> {
        self.cached.load_full()
    }

    /// The cached snapshot, fetching when forced or when nothing is cached
    pub async fn get(&self, force_refresh: bool) -> PoolResult<Arc<ClusterTopology>> {
        if !force_refresh {
            if let Some(cached) = self.cached.load_full() {
                return Ok(cached);
            }
        }

        match self.fetcher.fetch_topology(force_refresh).await {
            Ok(topology) => {
                let topology = Arc::new(topology);
                self.cached.store(Some(Arc::clone(&topology)));
                Ok(topology)
            }
            Err(e) => match self.cached.load_full() {
                Some(stale) => {
                    warn!("Topology fetch failed, serving cached snapshot: {}", e);
                    Ok(stale)
                }
                None => Err(match e {
                    PoolError::FetchFailure { .. } => e,
                    other => PoolError::fetch_failure(other.to_string()),
                }),
            },
        }
    }
}

/// A client kept in sync with one selector
#[derive(Debug, Clone)]
pub struct RefreshTask {
    pub client: TopologyAwareClient,
    pub selector: EndpointSelector,
}

impl RefreshTask {
    pub fn new(client: TopologyAwareClient, selector: EndpointSelector) -> Self {
        Self { client, selector }
    }
}

/// Endpoints of one selector, read through a shared cache
struct SelectorEndpoints {
    cache: Arc<TopologyCache>,
    selector: EndpointSelector,
}

#[async_trait]
impl EndpointsProvider for SelectorEndpoints {
    async fn endpoints(&self, force_refresh: bool) -> PoolResult<EndpointSet> {
        let topology = self.cache.get(force_refresh).await?;
        Ok(self.selector.apply(&topology))
    }
}

/// Periodically pushes fresh endpoint sets into registered clients
pub struct RefreshAgent {
    cache: Arc<TopologyCache>,
    runtime: Handle,
    started: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshAgent {
    pub fn new(fetcher: Arc<dyn TopologyFetcher>, runtime: Handle) -> Self {
        Self {
            cache: Arc::new(TopologyCache::new(fetcher)),
            runtime,
            started: AtomicBool::new(false),
            poller: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<TopologyCache> {
        &self.cache
    }

    /// Endpoints for `selector`, from the cache unless forced
    pub async fn get_endpoints(
        &self,
        selector: EndpointSelector,
        force_refresh: bool,
    ) -> PoolResult<EndpointSet> {
        let topology = self.cache.get(force_refresh).await?;
        Ok(selector.apply(&topology))
    }

    /// Provider for a client's eager refresh, sharing this agent's cache
    pub fn provider(&self, selector: EndpointSelector) -> Arc<dyn EndpointsProvider> {
        Arc::new(SelectorEndpoints {
            cache: Arc::clone(&self.cache),
            selector,
        })
    }

    /// Start polling every `delay`. May be called once per agent.
    pub fn start_polling(&self, tasks: Vec<RefreshTask>, delay: Duration) -> PoolResult<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ConfigError::AlreadyRunning("Refresh agent".to_string()).into());
        }

        let mut groups = group_by_selector(tasks);
        info!(
            "Refresh agent polling every {:?} for {} selectors",
            delay,
            groups.len()
        );

        let cache = Arc::clone(&self.cache);
        let poller = self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                if let Err(e) = poll_once(&cache, &mut groups).await {
                    warn!("Topology refresh failed: {}", e);
                }
                if groups.is_empty() {
                    info!("Refresh agent has no active clients left, stopping");
                    break;
                }
            }
        });
        *self.poller.lock() = Some(poller);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.poller
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Cancel polling. Registered clients are left open.
    pub fn stop(&self) {
        if let Some(task) = self.poller.lock().take() {
            task.abort();
            debug!("Refresh agent stopped");
        }
    }
}

impl Drop for RefreshAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

fn group_by_selector(tasks: Vec<RefreshTask>) -> BTreeMap<EndpointSelector, Vec<TopologyAwareClient>> {
    let mut groups: BTreeMap<EndpointSelector, Vec<TopologyAwareClient>> = BTreeMap::new();
    for task in tasks {
        groups.entry(task.selector).or_default().push(task.client);
    }
    groups
}

/// Forget clients that are closing or closed, and selectors left without
/// clients
fn prune_inactive(groups: &mut BTreeMap<EndpointSelector, Vec<TopologyAwareClient>>) {
    for clients in groups.values_mut() {
        clients.retain(|client| {
            let active = client.state() == ClientState::Active;
            if !active {
                debug!("Dropping {} client {} from refresh", client.state(), client.name());
            }
            active
        });
    }
    groups.retain(|_, clients| !clients.is_empty());
}

/// One fetch, then every selector applied once and its active clients
/// refreshed
async fn poll_once(
    cache: &TopologyCache,
    groups: &mut BTreeMap<EndpointSelector, Vec<TopologyAwareClient>>,
) -> PoolResult<()> {
    prune_inactive(groups);
    if groups.is_empty() {
        return Ok(());
    }
    let topology = cache.get(true).await?;
    for (selector, clients) in groups {
        let endpoints = selector.apply(&topology);
        debug!("Selector {} yields {} endpoints", selector, endpoints.len());
        for client in clients {
            client.refresh(endpoints.clone()).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InstanceRecord, InstanceRole};
    use crate::testing::{Behaviour, MockFactory};
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_err, assert_ok};

    /// Serves `topologies` in order, repeating the last one; errors while
    /// `failing` is set
    struct ScriptedFetcher {
        calls: AtomicUsize,
        failing: AtomicBool,
        topologies: Vec<ClusterTopology>,
    }

    impl ScriptedFetcher {
        fn new(topologies: Vec<ClusterTopology>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                topologies,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TopologyFetcher for ScriptedFetcher {
        async fn fetch_topology(&self, _force_refresh: bool) -> PoolResult<ClusterTopology> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(PoolError::fetch_failure("service unavailable"));
            }
            let index = call.min(self.topologies.len() - 1);
            Ok(self.topologies[index].clone())
        }
    }

    fn topology(writers: &[&str], readers: &[&str]) -> ClusterTopology {
        let instances = writers
            .iter()
            .map(|a| InstanceRecord::new(*a, InstanceRole::Writer, *a))
            .chain(
                readers
                    .iter()
                    .map(|a| InstanceRecord::new(*a, InstanceRole::Reader, *a)),
            )
            .collect();
        ClusterTopology::new(
            crate::core::Endpoint::new("cluster:8182"),
            crate::core::Endpoint::new("reader:8182"),
            instances,
        )
    }

    async fn client(addresses: &[&str]) -> TopologyAwareClient {
        let endpoints = addresses
            .iter()
            .map(|a| crate::core::Endpoint::new(*a))
            .collect();
        TopologyAwareClient::builder(MockFactory::new(Behaviour::Usable))
            .build(endpoints)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cache_serves_stale_on_failure() {
        let fetcher = ScriptedFetcher::new(vec![topology(&["w:1"], &[])]);
        let cache = TopologyCache::new(fetcher.clone());

        fetcher.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            cache.get(true).await,
            Err(PoolError::FetchFailure { .. })
        ));

        fetcher.failing.store(false, Ordering::SeqCst);
        let fresh = cache.get(true).await.unwrap();

        fetcher.failing.store(true, Ordering::SeqCst);
        let stale = cache.get(true).await.unwrap();
        assert!(Arc::ptr_eq(&fresh, &stale));

        // Unforced reads never hit the fetcher once cached
        let calls = fetcher.calls();
        cache.get(false).await.unwrap();
        assert_eq!(fetcher.calls(), calls);
    }

    #[tokio::test]
    async fn test_agent_get_endpoints() {
        let fetcher = ScriptedFetcher::new(vec![topology(&["w:1"], &["r:1", "r:2"])]);
        let agent = RefreshAgent::new(fetcher.clone(), Handle::current());

        let readers = agent
            .get_endpoints(EndpointSelector::ReadReplicas, false)
            .await
            .unwrap();
        assert_eq!(readers.addresses(), vec!["r:1", "r:2"]);

        let writers = agent.provider(EndpointSelector::Primary).endpoints(false).await.unwrap();
        assert_eq!(writers.addresses(), vec!["w:1"]);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_poll_fetches_once_per_run() {
        let fetcher = ScriptedFetcher::new(vec![topology(&["w:1"], &["r:1", "r:2"])]);
        let cache = TopologyCache::new(fetcher.clone());

        let writer = client(&["old:1"]).await;
        let reader_a = client(&["old:1"]).await;
        let reader_b = client(&["old:1"]).await;
        let mut groups = group_by_selector(vec![
            RefreshTask::new(writer.clone(), EndpointSelector::Primary),
            RefreshTask::new(reader_a.clone(), EndpointSelector::ReadReplicas),
            RefreshTask::new(reader_b.clone(), EndpointSelector::ReadReplicas),
        ]);

        poll_once(&cache, &mut groups).await.unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(writer.current_endpoints().addresses(), vec!["w:1"]);
        assert_eq!(reader_a.current_endpoints().addresses(), vec!["r:1", "r:2"]);
        assert_eq!(reader_b.current_endpoints().addresses(), vec!["r:1", "r:2"]);
    }

    #[tokio::test]
    async fn test_poll_drops_closed_clients() {
        let fetcher = ScriptedFetcher::new(vec![topology(&["w:1"], &["r:1"])]);
        let cache = TopologyCache::new(fetcher.clone());

        let writer = client(&["old:1"]).await;
        let reader = client(&["old:1"]).await;
        let mut groups = group_by_selector(vec![
            RefreshTask::new(writer.clone(), EndpointSelector::Primary),
            RefreshTask::new(reader.clone(), EndpointSelector::ReadReplicas),
        ]);

        reader.close().await;
        poll_once(&cache, &mut groups).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups.contains_key(&EndpointSelector::Primary));
        assert_eq!(writer.current_endpoints().addresses(), vec!["w:1"]);
        assert_eq!(fetcher.calls(), 1);

        // Nothing left to refresh, so nothing is fetched
        writer.close().await;
        poll_once(&cache, &mut groups).await.unwrap();
        assert!(groups.is_empty());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_stops_once_clients_are_closed() {
        let fetcher = ScriptedFetcher::new(vec![topology(&["w:1"], &[])]);
        let agent = RefreshAgent::new(fetcher.clone(), Handle::current());
        let writer = client(&["old:1"]).await;

        agent
            .start_polling(
                vec![RefreshTask::new(writer.clone(), EndpointSelector::Primary)],
                Duration::from_secs(1),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fetcher.calls(), 1);

        writer.close().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fetcher.calls(), 1);
        assert!(!agent.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_updates_clients_and_survives_failures() {
        let fetcher = ScriptedFetcher::new(vec![
            topology(&["w:1"], &[]),
            topology(&["w:2"], &[]),
        ]);
        let agent = RefreshAgent::new(fetcher.clone(), Handle::current());
        let writer = client(&["old:1"]).await;

        fetcher.failing.store(true, Ordering::SeqCst);
        agent
            .start_polling(
                vec![RefreshTask::new(writer.clone(), EndpointSelector::Primary)],
                Duration::from_secs(1),
            )
            .unwrap();
        assert!(agent.is_running());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(writer.current_endpoints().addresses(), vec!["old:1"]);

        fetcher.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(writer.current_endpoints().addresses(), vec!["w:2"]);

        agent.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_start_polling_only_once() {
        let fetcher = ScriptedFetcher::new(vec![topology(&["w:1"], &[])]);
        let agent = RefreshAgent::new(fetcher, Handle::current());

        assert_ok!(agent.start_polling(Vec::new(), Duration::from_secs(60)));
        assert!(matches!(
            agent.start_polling(Vec::new(), Duration::from_secs(60)),
            Err(PoolError::Config(ConfigError::AlreadyRunning(_)))
        ));

        agent.stop();
        assert!(!agent.is_running());
        assert_err!(agent.start_polling(Vec::new(), Duration::from_secs(60)));
    }
}
