/// Transport seam
///
/// The pool never speaks the wire protocol. It creates one
/// [`TransportClient`] per accepted endpoint through a [`TransportFactory`]
/// and asks it for a [`Connection`] when a request is routed to that
/// endpoint. Authentication handshakes and request signing live inside the
/// transport implementation.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::core::Endpoint;
use crate::error::TransportError;
use crate::utils::generate_id;

pub mod tcp;

pub use tcp::{TcpConnection, TcpTransport, TcpTransportFactory};

/// A request about to be routed. The pool only reads the trace id (for
/// request metrics); strategies may inspect the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    trace_id: String,
    operation: String,
    #[serde(default)]
    arguments: BTreeMap<String, serde_json::Value>,
}

impl RequestMessage {
    pub fn new<S: Into<String>>(operation: S) -> Self {
        Self {
            trace_id: generate_id("req"),
            operation: operation.into(),
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_trace_id<S: Into<String>>(mut self, trace_id: S) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_argument<K: Into<String>>(mut self, key: K, value: serde_json::Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn argument(&self, key: &str) -> Option<&serde_json::Value> {
        self.arguments.get(key)
    }
}

/// One physical connection handed out by a transport client
pub trait Connection: Send + Sync + fmt::Debug {
    fn address(&self) -> &str;

    /// The connection is shutting down and must not take new requests
    fn is_closing(&self) -> bool;

    /// The connection failed and will never recover
    fn is_dead(&self) -> bool;

    fn is_usable(&self) -> bool {
        !self.is_closing() && !self.is_dead()
    }
}

pub type SharedConnection = Arc<dyn Connection>;

/// Connection machinery bound to exactly one endpoint address
#[async_trait]
pub trait TransportClient: Send + Sync {
    fn address(&self) -> &str;

    /// Whether at least one healthy connection is currently open
    fn is_healthy(&self) -> bool;

    /// Pick a connection for the request. `Ok(None)` means nothing is
    /// available right now.
    async fn choose_connection(
        &self,
        request: &RequestMessage,
    ) -> Result<Option<SharedConnection>, TransportError>;

    /// Release every connection. Called once when the endpoint leaves the pool.
    async fn close(&self);
}

pub type SharedTransport = Arc<dyn TransportClient>;

/// Builds and initializes a transport client for one endpoint
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, endpoint: &Endpoint) -> Result<SharedTransport, TransportError>;
}
