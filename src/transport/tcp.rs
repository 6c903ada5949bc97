/// Plain TCP reference transport
///
/// Opens a fixed number of TCP connections per endpoint and hands them out
/// round-robin. It carries no wire protocol: callers lock the stream and
/// speak whatever protocol the server expects, marking the connection dead
/// on I/O failure. A dead connection is reopened the next time its slot
/// comes up.
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{Connection, RequestMessage, SharedConnection, SharedTransport, TransportClient, TransportFactory};
use crate::core::Endpoint;
use crate::error::TransportError;

/// One pooled TCP stream
#[derive(Debug)]
pub struct TcpConnection {
    address: String,
    stream: Mutex<TcpStream>,
    closing: AtomicBool,
    dead: AtomicBool,
}

impl TcpConnection {
    fn new(address: String, stream: TcpStream) -> Self {
        Self {
            address,
            stream: Mutex::new(stream),
            closing: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        }
    }

    /// Exclusive access to the underlying stream
    pub fn stream(&self) -> &Mutex<TcpStream> {
        &self.stream
    }

    /// Record an I/O failure; the slot reconnects on its next turn
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    async fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        let mut stream = self.stream.lock().await;
        if let Err(e) = stream.shutdown().await {
            debug!("Error shutting down connection to {}: {}", self.address, e);
        }
    }
}

impl Connection for TcpConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

/// TCP connections to one endpoint
pub struct TcpTransport {
    address: String,
    connect_timeout: Duration,
    slots: Vec<ArcSwap<TcpConnection>>,
    next: AtomicUsize,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn connection_count(&self) -> usize {
        self.slots.len()
    }

    fn closed_error(&self) -> TransportError {
        TransportError::Closed {
            address: self.address.clone(),
        }
    }

    /// Replace the dead connection in `slot`
    async fn reconnect(
        &self,
        slot: &ArcSwap<TcpConnection>,
    ) -> Result<Arc<TcpConnection>, TransportError> {
        let stream = connect(&self.address, self.connect_timeout).await?;
        let connection = Arc::new(TcpConnection::new(self.address.clone(), stream));
        if self.closed.load(Ordering::Acquire) {
            connection.shutdown().await;
            return Err(self.closed_error());
        }
        slot.store(Arc::clone(&connection));
        debug!("Reopened connection to {}", self.address);
        Ok(connection)
    }
}

#[async_trait]
impl TransportClient for TcpTransport {
    fn address(&self) -> &str {
        &self.address
    }

    /// Dead connections do not make the transport unhealthy; they are
    /// reopened on demand
    fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.slots.is_empty()
    }

    async fn choose_connection(
        &self,
        _request: &RequestMessage,
    ) -> Result<Option<SharedConnection>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        if self.slots.is_empty() {
            return Err(TransportError::NoHostAvailable {
                address: self.address.clone(),
            });
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let slot = &self.slots[index];
        let mut connection = slot.load_full();
        if connection.is_dead() {
            connection = self.reconnect(slot).await?;
        }
        let connection: SharedConnection = connection;
        Ok(Some(connection))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in &self.slots {
            slot.load_full().shutdown().await;
        }
        debug!("Closed {} connections to {}", self.slots.len(), self.address);
    }
}

/// Creates [`TcpTransport`]s
#[derive(Debug, Clone)]
pub struct TcpTransportFactory {
    connect_timeout: Duration,
    connections_per_endpoint: usize,
}

impl TcpTransportFactory {
    pub fn new(connect_timeout: Duration, connections_per_endpoint: usize) -> Self {
        Self {
            connect_timeout,
            connections_per_endpoint: connections_per_endpoint.max(1),
        }
    }

    /// Open the connections of one endpoint
    pub async fn open(&self, endpoint: &Endpoint) -> Result<TcpTransport, TransportError> {
        let address = endpoint.address().to_string();
        let mut slots = Vec::with_capacity(self.connections_per_endpoint);
        let mut last_error = None;

        for _ in 0..self.connections_per_endpoint {
            match connect(&address, self.connect_timeout).await {
                Ok(stream) => {
                    let connection = TcpConnection::new(address.clone(), stream);
                    slots.push(ArcSwap::from_pointee(connection));
                }
                Err(e) => {
                    debug!("Connection attempt to {} failed: {}", address, e);
                    last_error = Some(e);
                }
            }
        }

        // An endpoint that accepted no connection at all is not worth pooling
        if slots.is_empty() {
            return Err(last_error.unwrap_or(TransportError::NoHostAvailable { address }));
        }

        debug!("Opened {} connections to {}", slots.len(), address);
        Ok(TcpTransport {
            address,
            connect_timeout: self.connect_timeout,
            slots,
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }
}

async fn connect(address: &str, connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to configure stream to {}: {}", address, e);
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(connect_error(address, e)),
        Err(_) => Err(TransportError::Connect {
            address: address.to_string(),
            message: format!("timed out after {}ms", connect_timeout.as_millis()),
        }),
    }
}

impl Default for TcpTransportFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 2)
    }
}

fn connect_error(address: &str, e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => TransportError::NoHostAvailable {
            address: address.to_string(),
        },
        _ => TransportError::Connect {
            address: address.to_string(),
            message: e.to_string(),
        },
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn create(&self, endpoint: &Endpoint) -> Result<SharedTransport, TransportError> {
        Ok(Arc::new(self.open(endpoint).await?))
    }
}
