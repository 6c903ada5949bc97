/// Topology-aware client
///
/// Holds the current [`PoolCollection`] behind an atomic pointer and routes
/// each acquire through the selection strategy. A failed attempt (unhealthy
/// pool, no connection, closing or dead connection) is retried after a short
/// backoff until the maximum wait is exhausted. When an acquire has waited
/// long enough the client can ask its endpoints provider for a forced
/// refresh; at most one such refresh runs at a time and consecutive ones are
/// spaced by a backoff.
use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::EndpointSet;
use crate::error::{ConfigError, PoolError, PoolResult, TransportError};
use crate::filter::{EndpointFilter, FilterChain};
use crate::metrics::{ConnectionOutcome, PoolMetrics};
use crate::pool::{EndpointPool, PoolCollection};
use crate::refresh::EndpointsProvider;
use crate::strategy::{RoundRobin, SelectionStrategy};
use crate::transport::{RequestMessage, SharedConnection, TransportFactory};

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(16);
pub const DEFAULT_ACQUIRE_BACKOFF: Duration = Duration::from_millis(5);
pub const DEFAULT_EAGER_REFRESH_BACKOFF: Duration = Duration::from_secs(5);

/// Timing of the acquisition loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireSettings {
    /// Give up once an acquire has waited this long
    pub max_wait: Duration,
    /// Pause between failed attempts
    pub acquire_backoff: Duration,
    /// Request a forced refresh once an acquire has waited this long.
    /// `None` disables eager refresh.
    pub eager_refresh_wait: Option<Duration>,
    /// Minimum spacing between the end of one eager refresh and the next
    pub eager_refresh_backoff: Duration,
}

impl Default for AcquireSettings {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            acquire_backoff: DEFAULT_ACQUIRE_BACKOFF,
            eager_refresh_wait: None,
            eager_refresh_backoff: DEFAULT_EAGER_REFRESH_BACKOFF,
        }
    }
}

/// Lifecycle of a client. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Active,
    Closing,
    Closed,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Active,
            1 => ClientState::Closing,
            _ => ClientState::Closed,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Active => write!(f, "active"),
            ClientState::Closing => write!(f, "closing"),
            ClientState::Closed => write!(f, "closed"),
        }
    }
}

/// Counters of the acquisition loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttemptStats {
    pub failed_attempts: u64,
    pub empty_pool_waits: u64,
    pub eager_refreshes: u64,
    pub eager_refreshes_skipped: u64,
}

#[derive(Debug, Default)]
struct AttemptCounters {
    failed_attempts: AtomicU64,
    empty_pool_waits: AtomicU64,
    eager_refreshes: AtomicU64,
    eager_refreshes_skipped: AtomicU64,
}

/// Resolves once every pool of the client has been closed
pub type CloseHandle = Shared<BoxFuture<'static, ()>>;

struct ClientInner {
    name: String,
    pools: ArcSwap<PoolCollection>,
    reconcile_lock: tokio::sync::Mutex<()>,
    filter: FilterChain,
    factory: Arc<dyn TransportFactory>,
    strategy: Arc<dyn SelectionStrategy>,
    settings: AcquireSettings,
    eager_refresh: Option<Arc<dyn EndpointsProvider>>,
    runtime: Handle,
    state: AtomicU8,
    refreshing: AtomicBool,
    last_refresh: Mutex<Option<Instant>>,
    attempts: AttemptCounters,
    metrics: Arc<PoolMetrics>,
    background: Mutex<Option<JoinHandle<()>>>,
    close_handle: Mutex<Option<CloseHandle>>,
}

/// Connection pool over the endpoints of a cluster
#[derive(Clone)]
pub struct TopologyAwareClient {
    inner: Arc<ClientInner>,
}

/// Builder for [`TopologyAwareClient`]
pub struct ClientBuilder {
    name: String,
    factory: Arc<dyn TransportFactory>,
    filter: Option<Arc<dyn EndpointFilter>>,
    strategy: Option<Arc<dyn SelectionStrategy>>,
    settings: AcquireSettings,
    eager_refresh: Option<Arc<dyn EndpointsProvider>>,
    metrics: Option<Arc<PoolMetrics>>,
    runtime: Option<Handle>,
}

impl ClientBuilder {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            name: "graphpool".to_string(),
            factory,
            filter: None,
            strategy: None,
            settings: AcquireSettings::default(),
            eager_refresh: None,
            metrics: None,
            runtime: None,
        }
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Runs behind the built-in empty-address filter
    pub fn filter(mut self, filter: Arc<dyn EndpointFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn SelectionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn settings(mut self, settings: AcquireSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Source of forced refreshes. Only consulted when
    /// `AcquireSettings::eager_refresh_wait` is set.
    pub fn eager_refresh(mut self, provider: Arc<dyn EndpointsProvider>) -> Self {
        self.eager_refresh = Some(provider);
        self
    }

    pub fn metrics(mut self, metrics: Arc<PoolMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runtime for background work; defaults to the current one
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Create the client and pool the initial endpoints.
    ///
    /// Fails with [`ConfigError::NoEndpoints`] when nothing was accepted and
    /// nothing was rejected, i.e. the endpoint set was empty.
    pub async fn build(self, endpoints: EndpointSet) -> PoolResult<TopologyAwareClient> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|e| PoolError::internal(format!("No tokio runtime available: {}", e)))?,
        };

        let inner = Arc::new(ClientInner {
            name: self.name,
            pools: ArcSwap::from_pointee(PoolCollection::empty()),
            reconcile_lock: tokio::sync::Mutex::new(()),
            filter: FilterChain::baseline(self.filter),
            factory: self.factory,
            strategy: self
                .strategy
                .unwrap_or_else(|| Arc::new(RoundRobin::new())),
            settings: self.settings,
            eager_refresh: self.eager_refresh,
            runtime,
            state: AtomicU8::new(ClientState::Active as u8),
            refreshing: AtomicBool::new(false),
            last_refresh: Mutex::new(None),
            attempts: AttemptCounters::default(),
            metrics: self.metrics.unwrap_or_default(),
            background: Mutex::new(None),
            close_handle: Mutex::new(None),
        });

        let accepted = inner.apply(endpoints).await;
        let collection = inner.pools.load();
        if accepted == 0 && collection.rejected().is_empty() {
            return Err(ConfigError::NoEndpoints.into());
        }

        info!(
            "Client {} started with {} pools ({} rejected), strategy {}",
            inner.name,
            collection.len(),
            collection.rejected().len(),
            inner.strategy.name()
        );
        Ok(TopologyAwareClient { inner })
    }
}

impl ClientInner {
    fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_active(&self) -> bool {
        self.state() == ClientState::Active
    }

    /// Publish a new collection and stamp its completion. Eager refreshes
    /// back off from that stamp.
    async fn refresh(&self, endpoints: EndpointSet) -> usize {
        let accepted = self.apply(endpoints).await;
        if self.is_active() {
            *self.last_refresh.lock() = Some(Instant::now());
        }
        accepted
    }

    /// Reconcile and publish a new collection; returns how many endpoints
    /// the filter accepted.
    async fn apply(&self, endpoints: EndpointSet) -> usize {
        if !self.is_active() {
            debug!("Ignoring refresh of {} client {}", self.state(), self.name);
            return 0;
        }
        let _guard = self.reconcile_lock.lock().await;
        if !self.is_active() {
            return 0;
        }

        let current = self.pools.load_full();
        let reconciliation = current
            .reconcile(
                endpoints,
                &self.filter,
                self.factory.as_ref(),
                self.strategy.as_ref(),
            )
            .await;
        self.pools.store(Arc::new(reconciliation.collection));

        for pool in reconciliation.retired {
            self.runtime.spawn(async move {
                pool.close().await;
            });
        }
        reconciliation.accepted
    }

    /// One attempt against one pool
    async fn try_pool(
        &self,
        pool: &EndpointPool,
        request: &RequestMessage,
    ) -> Result<SharedConnection, ConnectionOutcome> {
        if !pool.is_healthy() {
            return Err(ConnectionOutcome::Unavailable);
        }
        match pool.transport().choose_connection(request).await {
            Ok(Some(connection)) if connection.is_closing() => Err(ConnectionOutcome::Closing),
            Ok(Some(connection)) if connection.is_dead() => Err(ConnectionOutcome::Dead),
            Ok(Some(connection)) => Ok(connection),
            Ok(None) => Err(ConnectionOutcome::NullResult),
            Err(TransportError::NoHostAvailable { .. }) => Err(ConnectionOutcome::NoHostAvailable),
            Err(e) => {
                debug!("Transport error on {}: {}", pool.address(), e);
                Err(ConnectionOutcome::Unavailable)
            }
        }
    }

    /// Fail if the acquire has waited too long, otherwise maybe trigger an
    /// eager refresh and back off.
    async fn wait_for_retry(self: &Arc<Self>, started: Instant) -> PoolResult<()> {
        let waited = started.elapsed();
        if waited >= self.settings.max_wait {
            let collection = self.pools.load();
            let reasons = collection.rejection_reasons();
            if reasons.is_empty() {
                warn!("Client {}: no connection after {:?}", self.name, waited);
                return Err(PoolError::timeout(waited));
            }
            warn!(
                "Client {}: no connection after {:?}, endpoints rejected: {:?}",
                self.name, waited, reasons
            );
            return Err(PoolError::endpoints_unavailable(reasons.iter().cloned()));
        }

        if let Some(eager_wait) = self.settings.eager_refresh_wait {
            if waited >= eager_wait {
                self.trigger_eager_refresh();
            }
        }

        tokio::time::sleep(self.settings.acquire_backoff).await;
        Ok(())
    }

    fn trigger_eager_refresh(self: &Arc<Self>) {
        let Some(provider) = self.eager_refresh.clone() else {
            return;
        };
        if !self.is_active() {
            return;
        }
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Eager refresh already in flight for {}", self.name);
            return;
        }

        // Checked after winning the flag so a refresh that just finished is seen
        let last_refresh = *self.last_refresh.lock();
        let within_backoff = last_refresh
            .map(|at| at.elapsed() < self.settings.eager_refresh_backoff)
            .unwrap_or(false);
        if within_backoff {
            self.attempts
                .eager_refreshes_skipped
                .fetch_add(1, Ordering::Relaxed);
            debug!("Eager refresh for {} skipped: backoff", self.name);
            self.refreshing.store(false, Ordering::Release);
            return;
        }

        self.attempts.eager_refreshes.fetch_add(1, Ordering::Relaxed);
        info!("Client {} triggering eager refresh", self.name);

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            match provider.endpoints(true).await {
                Ok(endpoints) => {
                    inner.refresh(endpoints).await;
                }
                Err(e) => {
                    warn!("Eager refresh for {} failed: {}", inner.name, e);
                    *inner.last_refresh.lock() = Some(Instant::now());
                }
            }
            inner.refreshing.store(false, Ordering::Release);
        });
    }

    async fn close_all(&self) {
        let _guard = self.reconcile_lock.lock().await;
        let collection = self.pools.swap(Arc::new(PoolCollection::empty()));
        let closing: Vec<_> = collection.pools().map(|pool| pool.close()).collect();
        let closed = futures::future::join_all(closing)
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count();
        self.state.store(ClientState::Closed as u8, Ordering::Release);
        info!("Client {} closed {} pools", self.name, closed);
    }
}

impl TopologyAwareClient {
    pub fn builder(factory: Arc<dyn TransportFactory>) -> ClientBuilder {
        ClientBuilder::new(factory)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Replace the pooled endpoint set. A no-op once the client is closing.
    pub async fn refresh(&self, endpoints: EndpointSet) {
        self.inner.refresh(endpoints).await;
    }

    /// Acquire a connection for `request`
    pub async fn acquire(&self, request: &RequestMessage) -> PoolResult<SharedConnection> {
        if !self.inner.is_active() {
            return Err(PoolError::ClientClosed);
        }

        let started = Instant::now();
        loop {
            let collection = self.inner.pools.load_full();
            let pool = match self
                .inner
                .strategy
                .select(request, collection.selectable())
            {
                Some(pool) => pool,
                None => {
                    self.inner
                        .attempts
                        .empty_pool_waits
                        .fetch_add(1, Ordering::Relaxed);
                    debug!("Client {} has no selectable endpoints", self.inner.name);
                    self.inner.wait_for_retry(started).await?;
                    continue;
                }
            };

            let attempt_started = Instant::now();
            let outcome = self.inner.try_pool(pool, request).await;
            let address = pool.address();
            match outcome {
                Ok(connection) => {
                    self.inner.metrics.connections.record(
                        &address,
                        ConnectionOutcome::Succeeded,
                        attempt_started.elapsed(),
                    );
                    self.inner
                        .metrics
                        .requests
                        .register(request.trace_id(), &address);
                    return Ok(connection);
                }
                Err(outcome) => {
                    self.inner
                        .metrics
                        .connections
                        .record(&address, outcome, attempt_started.elapsed());
                    self.inner
                        .attempts
                        .failed_attempts
                        .fetch_add(1, Ordering::Relaxed);
                    debug!("Attempt on {} failed: {:?}", address, outcome);
                    self.inner.wait_for_retry(started).await?;
                }
            }
        }
    }

    /// Record that the request with `trace_id` finished after `duration`
    pub fn complete_request(&self, trace_id: &str, duration: Duration) {
        self.inner.metrics.requests.complete(trace_id, duration);
    }

    /// Close every pool. New acquires fail immediately; acquires already in
    /// the loop run until they succeed or time out. Every call returns the
    /// same handle.
    pub fn close(&self) -> CloseHandle {
        let mut slot = self.inner.close_handle.lock();
        if let Some(handle) = slot.as_ref() {
            return handle.clone();
        }

        self.inner
            .state
            .store(ClientState::Closing as u8, Ordering::Release);
        if let Some(task) = self.inner.background.lock().take() {
            task.abort();
        }
        info!("Closing client {}", self.inner.name);

        let inner = Arc::clone(&self.inner);
        let task = self.inner.runtime.spawn(async move { inner.close_all().await });
        let handle = async move {
            if let Err(e) = task.await {
                warn!("Close task failed: {}", e);
            }
        }
        .boxed()
        .shared();

        *slot = Some(handle.clone());
        handle
    }

    /// Refresh from `provider` every `delay` until the client closes
    pub fn spawn_periodic_refresh(
        &self,
        provider: Arc<dyn EndpointsProvider>,
        delay: Duration,
    ) -> PoolResult<()> {
        if !self.inner.is_active() {
            return Err(PoolError::ClientClosed);
        }
        let mut background = self.inner.background.lock();
        if background.is_some() {
            return Err(ConfigError::AlreadyRunning(format!(
                "Periodic refresh for client {}",
                self.inner.name
            ))
            .into());
        }

        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        *background = Some(self.inner.runtime.spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.is_active() {
                    break;
                }
                match provider.endpoints(false).await {
                    Ok(endpoints) => {
                        inner.refresh(endpoints).await;
                    }
                    Err(e) => warn!("Periodic refresh for {} failed: {}", inner.name, e),
                }
            }
        }));
        Ok(())
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    pub fn settings(&self) -> &AcquireSettings {
        &self.inner.settings
    }

    /// Endpoints currently backed by a pool
    pub fn current_endpoints(&self) -> EndpointSet {
        self.inner.pools.load().endpoints()
    }

    /// Endpoints the filter rejected at the last refresh
    pub fn rejected_endpoints(&self) -> EndpointSet {
        self.inner.pools.load().rejected().clone()
    }

    pub fn attempt_stats(&self) -> AttemptStats {
        let counters = &self.inner.attempts;
        AttemptStats {
            failed_attempts: counters.failed_attempts.load(Ordering::Relaxed),
            empty_pool_waits: counters.empty_pool_waits.load(Ordering::Relaxed),
            eager_refreshes: counters.eager_refreshes.load(Ordering::Relaxed),
            eager_refreshes_skipped: counters.eager_refreshes_skipped.load(Ordering::Relaxed),
        }
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.inner.metrics
    }
}

impl fmt::Debug for TopologyAwareClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyAwareClient")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("pools", &self.inner.pools.load().len())
            .finish()
    }
}
