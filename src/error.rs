/// Unified error handling for graphpool
///
/// Callers of the acquisition path only ever see `EndpointsUnavailable` or
/// `Timeout`; per-attempt transport failures are absorbed by the retry loop.
/// The remaining variants cover topology fetching, configuration and the
/// ambient I/O and serialization concerns.
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for graphpool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every candidate endpoint was rejected by the endpoint filter
    #[error("Endpoints unavailable: {}", join_reasons(.reasons))]
    EndpointsUnavailable { reasons: BTreeSet<String> },

    /// Acquisition exceeded the maximum wait with nothing to explain it
    #[error("Timed out after {}ms waiting for a connection", .waited.as_millis())]
    Timeout { waited: Duration },

    /// Topology fetch failed and no cached snapshot was available
    #[error("Topology fetch failed: {message}")]
    FetchFailure { message: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The client is closing or closed and accepts no further work
    #[error("Client is closed")]
    ClientClosed,

    /// Transport errors surfaced outside the acquisition loop
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Topology document (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File or network I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("No endpoints supplied and no rejected endpoints to explain it")]
    NoEndpoints,
}

/// Errors reported by a transport client for a single attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("No host available at {address}")]
    NoHostAvailable { address: String },

    #[error("Failed to connect to {address}: {message}")]
    Connect { address: String, message: String },

    #[error("Transport for {address} is closed")]
    Closed { address: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for graphpool operations
pub type PoolResult<T> = Result<T, PoolError>;

fn join_reasons(reasons: &BTreeSet<String>) -> String {
    if reasons.is_empty() {
        return "no reason recorded".to_string();
    }
    reasons.iter().cloned().collect::<Vec<_>>().join(", ")
}

/// Convenience methods for creating specific error types
impl PoolError {
    /// Create an endpoints-unavailable error from rejection reasons
    pub fn endpoints_unavailable<I, S>(reasons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PoolError::EndpointsUnavailable {
            reasons: reasons.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a timeout error
    pub fn timeout(waited: Duration) -> Self {
        PoolError::Timeout { waited }
    }

    /// Create a fetch failure error
    pub fn fetch_failure<S: Into<String>>(message: S) -> Self {
        PoolError::FetchFailure {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        PoolError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            PoolError::EndpointsUnavailable { .. } => true,
            PoolError::Timeout { .. } => true,
            PoolError::FetchFailure { .. } => true,
            PoolError::Transport(_) => true,
            PoolError::Io(_) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PoolError::Config(_) => ErrorSeverity::Critical,
            PoolError::Internal { .. } => ErrorSeverity::Critical,
            PoolError::EndpointsUnavailable { .. } => ErrorSeverity::Warning,
            PoolError::Timeout { .. } => ErrorSeverity::Warning,
            PoolError::FetchFailure { .. } => ErrorSeverity::Warning,
            PoolError::ClientClosed => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

impl TransportError {
    pub fn other<S: Into<String>>(message: S) -> Self {
        TransportError::Other(message.into())
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_unavailable_message() {
        let error = PoolError::endpoints_unavailable(["suspended", "unavailable"]);
        assert_eq!(
            error.to_string(),
            "Endpoints unavailable: suspended, unavailable"
        );
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_timeout_message() {
        let error = PoolError::timeout(Duration::from_millis(250));
        assert_eq!(
            error.to_string(),
            "Timed out after 250ms waiting for a connection"
        );
        assert_eq!(error.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_error_severity() {
        let config_error = PoolError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);
        assert!(!config_error.is_recoverable());

        let closed = PoolError::ClientClosed;
        assert_eq!(closed.severity(), ErrorSeverity::Info);
        assert!(!closed.is_recoverable());
    }

    #[test]
    fn test_already_running_message() {
        let error = PoolError::from(ConfigError::AlreadyRunning("refresh agent".to_string()));
        assert_eq!(
            error.to_string(),
            "Configuration error: refresh agent is already running"
        );
    }

    #[test]
    fn test_transport_error_conversion() {
        let error: PoolError = TransportError::NoHostAvailable {
            address: "db-1:8182".to_string(),
        }
        .into();
        assert!(matches!(error, PoolError::Transport(_)));
        assert_eq!(
            error.to_string(),
            "Transport error: No host available at db-1:8182"
        );
    }
}
