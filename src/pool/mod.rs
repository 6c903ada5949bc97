/// Per-endpoint pools and the immutable collection that holds them.
///
/// A [`PoolCollection`] is never mutated once published. Refreshing the
/// endpoint set builds a new collection through [`PoolCollection::reconcile`],
/// carrying over the pool of every address present in both the old and the
/// new set and listing the pools that dropped out so the caller can close
/// them.
use arc_swap::ArcSwap;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::{Endpoint, EndpointSet};
use crate::filter::EndpointFilter;
use crate::strategy::SelectionStrategy;
use crate::transport::{SharedTransport, TransportFactory};

/// Connection machinery for one endpoint address
pub struct EndpointPool {
    endpoint: ArcSwap<Endpoint>,
    transport: SharedTransport,
    closed: AtomicBool,
}

impl EndpointPool {
    pub fn new(endpoint: Endpoint, transport: SharedTransport) -> Self {
        Self {
            endpoint: ArcSwap::from_pointee(endpoint),
            transport,
            closed: AtomicBool::new(false),
        }
    }

    /// The latest metadata published for this address
    pub fn endpoint(&self) -> Arc<Endpoint> {
        self.endpoint.load_full()
    }

    pub fn address(&self) -> String {
        self.endpoint.load().address().to_string()
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        !self.is_closed() && self.transport.is_healthy()
    }

    /// Annotations and metrics may change between refreshes while the
    /// address, and therefore the pool, stays the same.
    fn update_endpoint(&self, endpoint: Endpoint) {
        self.endpoint.store(Arc::new(endpoint));
    }

    /// Close the transport. Only the first call does any work; returns
    /// whether this call closed it.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.transport.close().await;
        debug!("Closed pool for {}", self.transport.address());
        true
    }
}

impl fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointPool")
            .field("address", &self.address())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Immutable snapshot of the pooled endpoints
#[derive(Debug, Clone, Default)]
pub struct PoolCollection {
    pools: BTreeMap<String, Arc<EndpointPool>>,
    selectable: Vec<Arc<EndpointPool>>,
    rejected: EndpointSet,
    rejection_reasons: BTreeSet<String>,
}

/// Outcome of [`PoolCollection::reconcile`]
#[derive(Debug)]
pub struct Reconciliation {
    pub collection: PoolCollection,
    /// Endpoints the filter accepted, including any whose transport failed
    pub accepted: usize,
    pub created: Vec<String>,
    pub retained: Vec<String>,
    pub failed: Vec<String>,
    /// Pools no longer in the collection; the caller closes them
    pub retired: Vec<Arc<EndpointPool>>,
}

impl PoolCollection {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn get(&self, address: &str) -> Option<&Arc<EndpointPool>> {
        self.pools.get(address)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<EndpointPool>> {
        self.pools.values()
    }

    /// Pools laid out by the selection strategy
    pub fn selectable(&self) -> &[Arc<EndpointPool>] {
        &self.selectable
    }

    pub fn rejected(&self) -> &EndpointSet {
        &self.rejected
    }

    pub fn rejection_reasons(&self) -> &BTreeSet<String> {
        &self.rejection_reasons
    }

    /// Endpoints of every pool currently held
    pub fn endpoints(&self) -> EndpointSet {
        self.pools
            .values()
            .map(|pool| pool.endpoint().as_ref().clone())
            .collect()
    }

    /// Build the collection for a new endpoint set.
    ///
    /// Pools whose address survives are reused and take the new endpoint
    /// metadata; new addresses get a transport from `factory`. A factory
    /// failure is logged and the endpoint left out. The pools of `self` are
    /// left in place, but a reused pool is shared, so `self` sees its new
    /// metadata too.
    pub async fn reconcile(
        &self,
        endpoints: EndpointSet,
        filter: &dyn EndpointFilter,
        factory: &dyn TransportFactory,
        strategy: &dyn SelectionStrategy,
    ) -> Reconciliation {
        let partition = endpoints.partition(filter);
        let rejection_reasons = partition.rejection_reasons();
        for endpoint in partition.rejected.iter() {
            debug!(
                "Rejected endpoint {}: {}",
                endpoint.address(),
                endpoint
                    .annotation(crate::core::annotations::REJECTED_REASON)
                    .unwrap_or("unknown")
            );
        }

        let accepted = partition.accepted.len();
        let mut pools = BTreeMap::new();
        let mut retained = Vec::new();
        let mut to_create = Vec::new();

        for endpoint in partition.accepted {
            match self.pools.get(endpoint.address()) {
                Some(pool) => {
                    retained.push(endpoint.address().to_string());
                    pool.update_endpoint(endpoint.clone());
                    pools.insert(endpoint.address().to_string(), Arc::clone(pool));
                }
                None => to_create.push(endpoint),
            }
        }

        let results = join_all(to_create.iter().map(|endpoint| factory.create(endpoint))).await;

        let mut created = Vec::new();
        let mut failed = Vec::new();
        for (endpoint, result) in to_create.into_iter().zip(results) {
            match result {
                Ok(transport) => {
                    created.push(endpoint.address().to_string());
                    let pool = Arc::new(EndpointPool::new(endpoint, transport));
                    pools.insert(pool.address(), pool);
                }
                Err(e) => {
                    warn!("Failed to create transport for {}: {}", endpoint.address(), e);
                    failed.push(endpoint.address().to_string());
                }
            }
        }

        let retired: Vec<Arc<EndpointPool>> = self
            .pools
            .iter()
            .filter(|(address, _)| !pools.contains_key(*address))
            .map(|(_, pool)| Arc::clone(pool))
            .collect();

        let selectable = strategy.init(pools.values().cloned().collect());

        if !created.is_empty() || !retired.is_empty() {
            info!(
                "Pool collection updated: {} pools ({} new, {} retired, {} rejected)",
                pools.len(),
                created.len(),
                retired.len(),
                partition.rejected.len()
            );
        }

        Reconciliation {
            collection: PoolCollection {
                pools,
                selectable,
                rejected: partition.rejected,
                rejection_reasons,
            },
            accepted,
            created,
            retained,
            failed,
            retired,
        }
    }
}
