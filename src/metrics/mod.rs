/// Connection and request metrics
///
/// Connection metrics count the outcome of every acquire attempt per
/// endpoint address. Request metrics correlate an acquired connection with
/// the completion of the request it served through the request trace id.
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const DEFAULT_MAX_TRACE_IDS: usize = 1000;

/// Outcome of one acquire attempt against one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Succeeded,
    /// The endpoint pool was unhealthy or the transport errored
    Unavailable,
    Closing,
    Dead,
    /// The transport had no connection to offer
    NullResult,
    NoHostAvailable,
}

#[derive(Debug)]
struct LatencyStats {
    count: AtomicU64,
    total_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    fn record(&self, latency: Duration) {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(micros, Ordering::Relaxed);
        self.min_us.fetch_min(micros, Ordering::Relaxed);
        self.max_us.fetch_max(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return LatencySnapshot::default();
        }
        let total = self.total_us.load(Ordering::Relaxed);
        LatencySnapshot {
            min_ms: self.min_us.load(Ordering::Relaxed) as f64 / 1000.0,
            max_ms: self.max_us.load(Ordering::Relaxed) as f64 / 1000.0,
            avg_ms: total as f64 / count as f64 / 1000.0,
            total_ms: total as f64 / 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug)]
struct AddressConnectionStats {
    succeeded: AtomicU64,
    unavailable: AtomicU64,
    closing: AtomicU64,
    dead: AtomicU64,
    null_result: AtomicU64,
    no_host_available: AtomicU64,
    latency: LatencyStats,
}

impl AddressConnectionStats {
    fn new() -> Self {
        Self {
            succeeded: AtomicU64::new(0),
            unavailable: AtomicU64::new(0),
            closing: AtomicU64::new(0),
            dead: AtomicU64::new(0),
            null_result: AtomicU64::new(0),
            no_host_available: AtomicU64::new(0),
            latency: LatencyStats::new(),
        }
    }

    fn counter(&self, outcome: ConnectionOutcome) -> &AtomicU64 {
        match outcome {
            ConnectionOutcome::Succeeded => &self.succeeded,
            ConnectionOutcome::Unavailable => &self.unavailable,
            ConnectionOutcome::Closing => &self.closing,
            ConnectionOutcome::Dead => &self.dead,
            ConnectionOutcome::NullResult => &self.null_result,
            ConnectionOutcome::NoHostAvailable => &self.no_host_available,
        }
    }
}

/// Per-address acquire attempt counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionMetricsSnapshot {
    pub address: String,
    pub succeeded: u64,
    pub unavailable: u64,
    pub closing: u64,
    pub dead: u64,
    pub null_result: u64,
    pub no_host_available: u64,
    pub latency: LatencySnapshot,
}

impl ConnectionMetricsSnapshot {
    pub fn attempts(&self) -> u64 {
        self.succeeded
            + self.unavailable
            + self.closing
            + self.dead
            + self.null_result
            + self.no_host_available
    }
}

#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    per_address: DashMap<String, AddressConnectionStats>,
}

impl ConnectionMetrics {
    pub fn record(&self, address: &str, outcome: ConnectionOutcome, latency: Duration) {
        if let Some(stats) = self.per_address.get(address) {
            stats.counter(outcome).fetch_add(1, Ordering::Relaxed);
            stats.latency.record(latency);
            return;
        }
        let stats = self
            .per_address
            .entry(address.to_string())
            .or_insert_with(AddressConnectionStats::new);
        stats.counter(outcome).fetch_add(1, Ordering::Relaxed);
        stats.latency.record(latency);
    }

    pub fn snapshot(&self) -> Vec<ConnectionMetricsSnapshot> {
        let mut snapshots: Vec<ConnectionMetricsSnapshot> = self
            .per_address
            .iter()
            .map(|entry| {
                let stats = entry.value();
                ConnectionMetricsSnapshot {
                    address: entry.key().clone(),
                    succeeded: stats.succeeded.load(Ordering::Relaxed),
                    unavailable: stats.unavailable.load(Ordering::Relaxed),
                    closing: stats.closing.load(Ordering::Relaxed),
                    dead: stats.dead.load(Ordering::Relaxed),
                    null_result: stats.null_result.load(Ordering::Relaxed),
                    no_host_available: stats.no_host_available.load(Ordering::Relaxed),
                    latency: stats.latency.snapshot(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.address.cmp(&b.address));
        snapshots
    }
}

#[derive(Debug)]
struct AddressRequestStats {
    count: AtomicU64,
    latency: LatencyStats,
}

/// Trace ids in registration order. `order` may hold stale entries for
/// completed or re-registered ids; only entries whose sequence matches
/// `addresses` are live.
#[derive(Debug, Default)]
struct TraceTable {
    addresses: HashMap<String, (String, u64)>,
    order: VecDeque<(String, u64)>,
    next_seq: u64,
}

/// Per-address request counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMetricsSnapshot {
    pub address: String,
    pub count: u64,
    pub completed: u64,
    pub rate_per_sec: f64,
    pub latency: LatencySnapshot,
}

/// Request metrics keyed by the trace id of each routed request.
///
/// At most `max_trace_ids` requests are tracked; registering one more
/// evicts the oldest and counts it as dropped. Completing a request that is
/// not tracked counts it as skipped.
///
/// Registration never waits on the trace table: it queues the id and folds
/// the queue in only when the table is free. Every other call folds in
/// pending registrations before reading the table.
#[derive(Debug)]
pub struct RequestMetrics {
    started: Instant,
    max_trace_ids: usize,
    per_address: DashMap<String, AddressRequestStats>,
    pending: SegQueue<(String, String)>,
    traces: Mutex<TraceTable>,
    dropped: AtomicU64,
    skipped: AtomicU64,
}

impl RequestMetrics {
    pub fn new(max_trace_ids: usize) -> Self {
        Self {
            started: Instant::now(),
            max_trace_ids: max_trace_ids.max(1),
            per_address: DashMap::new(),
            pending: SegQueue::new(),
            traces: Mutex::new(TraceTable::default()),
            dropped: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Remember that the request with `trace_id` was routed to `address`
    pub fn register(&self, trace_id: &str, address: &str) {
        self.per_address
            .entry(address.to_string())
            .or_insert_with(|| AddressRequestStats {
                count: AtomicU64::new(0),
                latency: LatencyStats::new(),
            })
            .count
            .fetch_add(1, Ordering::Relaxed);

        self.pending.push((trace_id.to_string(), address.to_string()));
        if let Some(mut traces) = self.traces.try_lock() {
            self.drain_pending(&mut traces);
        }
    }

    /// Lock the table with every pending registration applied
    fn settled(&self) -> MutexGuard<'_, TraceTable> {
        let mut traces = self.traces.lock();
        self.drain_pending(&mut traces);
        traces
    }

    fn drain_pending(&self, traces: &mut TraceTable) {
        let TraceTable {
            addresses,
            order,
            next_seq,
        } = traces;

        while let Some((trace_id, address)) = self.pending.pop() {
            let seq = *next_seq;
            *next_seq += 1;
            addresses.insert(trace_id.clone(), (address, seq));
            order.push_back((trace_id, seq));
        }

        while addresses.len() > self.max_trace_ids {
            let Some((oldest, seq)) = order.pop_front() else {
                break;
            };
            if addresses.get(&oldest).is_some_and(|(_, live)| *live == seq) {
                addresses.remove(&oldest);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        if order.len() > self.max_trace_ids.saturating_mul(2) {
            order.retain(|(trace_id, seq)| {
                addresses
                    .get(trace_id)
                    .is_some_and(|(_, live)| live == seq)
            });
        }
    }

    /// Record the latency of a completed request
    pub fn complete(&self, trace_id: &str, duration: Duration) {
        let address = self
            .settled()
            .addresses
            .remove(trace_id)
            .map(|(address, _)| address);

        match address.and_then(|address| self.per_address.get(&address)) {
            Some(stats) => stats.latency.record(duration),
            None => {
                debug!("Skipping metrics for untracked request {}", trace_id);
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.settled().addresses.len()
    }

    pub fn dropped(&self) -> u64 {
        drop(self.settled());
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<RequestMetricsSnapshot> {
        let elapsed = self.started.elapsed().as_secs_f64().max(f64::EPSILON);
        let mut snapshots: Vec<RequestMetricsSnapshot> = self
            .per_address
            .iter()
            .map(|entry| {
                let count = entry.value().count.load(Ordering::Relaxed);
                RequestMetricsSnapshot {
                    address: entry.key().clone(),
                    count,
                    completed: entry.value().latency.count.load(Ordering::Relaxed),
                    rate_per_sec: count as f64 / elapsed,
                    latency: entry.value().latency.snapshot(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.address.cmp(&b.address));
        snapshots
    }
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRACE_IDS)
    }
}

/// Connection and request metrics of one client
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub connections: ConnectionMetrics,
    pub requests: RequestMetrics,
}

impl PoolMetrics {
    pub fn new(max_trace_ids: usize) -> Self {
        Self {
            connections: ConnectionMetrics::default(),
            requests: RequestMetrics::new(max_trace_ids),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: self.connections.snapshot(),
            requests: self.requests.snapshot(),
            tracked_requests: self.requests.tracked(),
            dropped_requests: self.requests.dropped(),
            skipped_requests: self.requests.skipped(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub connections: Vec<ConnectionMetricsSnapshot>,
    pub requests: Vec<RequestMetricsSnapshot>,
    pub tracked_requests: usize,
    pub dropped_requests: u64,
    pub skipped_requests: u64,
}

/// Receives periodic metrics snapshots
pub trait MetricsHandler: Send + Sync {
    fn on_metrics(&self, snapshot: &MetricsSnapshot);
}

/// Writes each snapshot to the log as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMetricsHandler;

impl MetricsHandler for LoggingMetricsHandler {
    fn on_metrics(&self, snapshot: &MetricsSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(json) => info!(target: "graphpool::metrics", "{}", json),
            Err(e) => debug!("Failed to serialize metrics snapshot: {}", e),
        }
    }
}

/// Hand a snapshot to `handler` every `interval` until the task is aborted
pub fn spawn_metrics_publisher(
    metrics: Arc<PoolMetrics>,
    handler: Arc<dyn MetricsHandler>,
    interval: Duration,
    runtime: &Handle,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            handler.on_metrics(&metrics.snapshot());
        }
    })
}
