/// Configuration management for graphpool
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::client::AcquireSettings;
use crate::core::{ClusterTopology, EndpointSelector};
use crate::filter::{EndpointFilter, FilterChain, SuspendedEndpoints, UnavailableStatusFilter};
use crate::metrics::DEFAULT_MAX_TRACE_IDS;
use crate::refresh::{FileTopology, StaticTopology, TopologyFetcher};
use crate::strategy::weighted::{DEFAULT_BASELINE_SLOTS, DEFAULT_QUEUE_CAPACITY};
use crate::strategy::{LoadMetric, LoadWeighted, RoundRobin, SelectionStrategy};
use crate::transport::TcpTransportFactory;

pub use crate::error::ConfigError;

/// Main graphpool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Acquisition and transport configuration
    pub client: ClientConfig,
    /// Topology refresh configuration
    pub refresh: RefreshConfig,
    /// Endpoint filter configuration
    #[serde(default)]
    pub filter: FilterConfig,
    /// Selection strategy configuration
    pub strategy: StrategyConfig,
    /// Metrics publishing configuration
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Acquisition and transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Give up acquiring a connection after this many milliseconds
    pub max_wait_ms: u64,
    /// Pause between failed attempts in milliseconds
    pub acquire_backoff_ms: u64,
    /// Force a topology refresh once an acquire has waited this long
    pub eager_refresh_wait_ms: Option<u64>,
    /// Minimum milliseconds between eager refreshes
    pub eager_refresh_backoff_ms: u64,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Connections opened per endpoint
    pub connections_per_endpoint: usize,
}

/// Topology refresh configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Delay between polls in seconds
    pub interval_sec: u64,
    /// Which endpoints of the topology to pool
    pub selector: EndpointSelector,
    /// Where topology snapshots come from
    pub source: TopologySourceConfig,
}

/// Topology source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TopologySourceConfig {
    /// A JSON topology document re-read on every poll
    #[serde(rename = "file")]
    File { path: String },
    /// A fixed list of instance addresses
    #[serde(rename = "static")]
    Static {
        cluster_endpoint: String,
        reader_endpoint: String,
        instances: Vec<String>,
    },
}

/// Endpoint filter configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Addresses that must not be pooled
    #[serde(default)]
    pub suspended: Vec<String>,
    /// Reject instances whose status is not `available`
    #[serde(default)]
    pub reject_unavailable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    LoadWeighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    QueueDepth,
    CpuUtilization,
}

/// Selection strategy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    /// Load metric for `load_weighted`
    pub metric: MetricKind,
    /// Queue depth at which an endpoint counts as fully loaded
    pub queue_capacity: f64,
    /// Slots every endpoint gets regardless of load
    pub baseline_slots: usize,
}

/// Metrics publishing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Log a metrics snapshot periodically
    pub enabled: bool,
    /// Seconds between snapshots
    pub publish_interval_sec: u64,
    /// Maximum number of in-flight requests tracked by trace id
    pub max_trace_ids: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: ClientConfig {
                max_wait_ms: 16_000,
                acquire_backoff_ms: 5,
                eager_refresh_wait_ms: Some(5_000),
                eager_refresh_backoff_ms: 5_000,
                connect_timeout_ms: 5_000,
                connections_per_endpoint: 2,
            },
            refresh: RefreshConfig {
                interval_sec: 60,
                selector: EndpointSelector::All,
                source: TopologySourceConfig::Static {
                    cluster_endpoint: "127.0.0.1:8182".to_string(),
                    reader_endpoint: "127.0.0.1:8182".to_string(),
                    instances: vec!["127.0.0.1:8182".to_string()],
                },
            },
            filter: FilterConfig::default(),
            strategy: StrategyConfig {
                kind: StrategyKind::RoundRobin,
                metric: MetricKind::QueueDepth,
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
                baseline_slots: DEFAULT_BASELINE_SLOTS,
            },
            metrics: MetricsConfig {
                enabled: false,
                publish_interval_sec: 60,
                max_trace_ids: DEFAULT_MAX_TRACE_IDS,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::ValidationError(message.to_string()));

        // Validate client config
        let client = &self.client;
        if client.max_wait_ms == 0 {
            return invalid("max_wait_ms must be greater than 0");
        }
        if client.acquire_backoff_ms == 0 || client.acquire_backoff_ms >= client.max_wait_ms {
            return invalid("acquire_backoff_ms must be greater than 0 and less than max_wait_ms");
        }
        if let Some(eager_wait) = client.eager_refresh_wait_ms {
            if eager_wait >= client.max_wait_ms {
                return invalid("eager_refresh_wait_ms must be less than max_wait_ms");
            }
        }
        if client.connect_timeout_ms == 0 {
            return invalid("connect_timeout_ms must be greater than 0");
        }
        if client.connections_per_endpoint == 0 {
            return invalid("connections_per_endpoint must be greater than 0");
        }

        // Validate refresh config
        if self.refresh.interval_sec == 0 {
            return invalid("refresh interval_sec must be greater than 0");
        }
        match &self.refresh.source {
            TopologySourceConfig::File { path } => {
                if path.trim().is_empty() {
                    return invalid("topology file path cannot be empty");
                }
            }
            TopologySourceConfig::Static {
                cluster_endpoint,
                instances,
                ..
            } => {
                if cluster_endpoint.trim().is_empty() && instances.is_empty() {
                    return invalid("static topology needs a cluster endpoint or instances");
                }
                if let Some(blank) = instances.iter().find(|i| i.trim().is_empty()) {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid instance address: {:?}",
                        blank
                    )));
                }
            }
        }

        // Validate strategy config
        if !self.strategy.queue_capacity.is_finite() || self.strategy.queue_capacity <= 0.0 {
            return invalid("queue_capacity must be a positive number");
        }

        // Validate metrics config
        if self.metrics.enabled && self.metrics.publish_interval_sec == 0 {
            return invalid("metrics publish_interval_sec must be greater than 0");
        }
        if self.metrics.max_trace_ids == 0 {
            return invalid("max_trace_ids must be greater than 0");
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, source: &str) -> Result<(), ConfigError> {
        let defaults = Config::default();
        let config = match source {
            "static" => Config {
                refresh: RefreshConfig {
                    source: TopologySourceConfig::Static {
                        cluster_endpoint: "cluster.graph.internal:8182".to_string(),
                        reader_endpoint: "reader.graph.internal:8182".to_string(),
                        instances: vec![
                            "10.0.1.10:8182".to_string(),
                            "10.0.1.11:8182".to_string(),
                            "10.0.1.12:8182".to_string(),
                        ],
                    },
                    ..defaults.refresh.clone()
                },
                ..defaults
            },
            "file" => Config {
                refresh: RefreshConfig {
                    selector: EndpointSelector::ReadReplicas,
                    source: TopologySourceConfig::File {
                        path: "/etc/graphpool/topology.json".to_string(),
                    },
                    ..defaults.refresh.clone()
                },
                strategy: StrategyConfig {
                    kind: StrategyKind::LoadWeighted,
                    ..defaults.strategy.clone()
                },
                ..defaults
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Source must be 'static' or 'file'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

impl ClientConfig {
    pub fn acquire_settings(&self) -> AcquireSettings {
        AcquireSettings {
            max_wait: Duration::from_millis(self.max_wait_ms),
            acquire_backoff: Duration::from_millis(self.acquire_backoff_ms),
            eager_refresh_wait: self.eager_refresh_wait_ms.map(Duration::from_millis),
            eager_refresh_backoff: Duration::from_millis(self.eager_refresh_backoff_ms),
        }
    }

    pub fn transport_factory(&self) -> TcpTransportFactory {
        TcpTransportFactory::new(
            Duration::from_millis(self.connect_timeout_ms),
            self.connections_per_endpoint,
        )
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    pub fn fetcher(&self) -> Arc<dyn TopologyFetcher> {
        match &self.source {
            TopologySourceConfig::File { path } => Arc::new(FileTopology::new(path)),
            TopologySourceConfig::Static {
                cluster_endpoint,
                reader_endpoint,
                instances,
            } => Arc::new(StaticTopology::new(ClusterTopology::from_static_list(
                cluster_endpoint,
                reader_endpoint,
                instances,
            ))),
        }
    }
}

impl FilterConfig {
    pub fn build(&self) -> Arc<dyn EndpointFilter> {
        let mut chain = FilterChain::new();
        if !self.suspended.is_empty() {
            chain = chain.with(SuspendedEndpoints::new(self.suspended.iter().cloned()));
        }
        if self.reject_unavailable {
            chain = chain.with(UnavailableStatusFilter);
        }
        Arc::new(chain)
    }
}

impl StrategyConfig {
    pub fn load_metric(&self) -> LoadMetric {
        match self.metric {
            MetricKind::QueueDepth => LoadMetric::QueueDepth {
                capacity: self.queue_capacity,
            },
            MetricKind::CpuUtilization => LoadMetric::CpuUtilization,
        }
    }

    pub fn build(&self) -> Arc<dyn SelectionStrategy> {
        match self.kind {
            StrategyKind::RoundRobin => Arc::new(RoundRobin::new()),
            StrategyKind::LoadWeighted => Arc::new(LoadWeighted::with_baseline(
                self.load_metric(),
                self.baseline_slots,
            )),
        }
    }
}

impl MetricsConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_sec)
    }
}
