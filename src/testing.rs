/// Test doubles for the transport seam
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::Endpoint;
use crate::error::TransportError;
use crate::pool::EndpointPool;
use crate::transport::{
    Connection, RequestMessage, SharedConnection, SharedTransport, TransportClient,
    TransportFactory,
};

/// What a mock transport hands out from `choose_connection`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behaviour {
    Usable,
    Null,
    Closing,
    Dead,
    NoHost,
}

#[derive(Debug)]
pub(crate) struct MockConnection {
    address: String,
    closing: bool,
    dead: bool,
}

impl Connection for MockConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_closing(&self) -> bool {
        self.closing
    }

    fn is_dead(&self) -> bool {
        self.dead
    }
}

pub(crate) struct MockTransport {
    address: String,
    behaviour: Mutex<Behaviour>,
    healthy: AtomicBool,
    closes: AtomicUsize,
    chosen: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new(address: &str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            behaviour: Mutex::new(behaviour),
            healthy: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
            chosen: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock() = behaviour;
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn chosen_count(&self) -> usize {
        self.chosen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportClient for MockTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn choose_connection(
        &self,
        _request: &RequestMessage,
    ) -> Result<Option<SharedConnection>, TransportError> {
        self.chosen.fetch_add(1, Ordering::SeqCst);
        let behaviour = *self.behaviour.lock();
        let connection = |closing, dead| -> SharedConnection {
            Arc::new(MockConnection {
                address: self.address.clone(),
                closing,
                dead,
            })
        };
        match behaviour {
            Behaviour::Usable => Ok(Some(connection(false, false))),
            Behaviour::Null => Ok(None),
            Behaviour::Closing => Ok(Some(connection(true, false))),
            Behaviour::Dead => Ok(Some(connection(false, true))),
            Behaviour::NoHost => Err(TransportError::NoHostAvailable {
                address: self.address.clone(),
            }),
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.healthy.store(false, Ordering::SeqCst);
    }
}

/// Records every transport it creates; addresses listed as failing error out
pub(crate) struct MockFactory {
    behaviour: Behaviour,
    failing: HashSet<String>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub(crate) fn new(behaviour: Behaviour) -> Arc<Self> {
        Self::failing(behaviour, &[])
    }

    pub(crate) fn failing(behaviour: Behaviour, addresses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            failing: addresses.iter().map(|a| a.to_string()).collect(),
            created: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn created_addresses(&self) -> Vec<String> {
        self.created
            .lock()
            .iter()
            .map(|t| t.address().to_string())
            .collect()
    }

    pub(crate) fn transport(&self, address: &str) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|t| t.address() == address)
            .cloned()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(&self, endpoint: &Endpoint) -> Result<SharedTransport, TransportError> {
        if self.failing.contains(endpoint.address()) {
            return Err(TransportError::Connect {
                address: endpoint.address().to_string(),
                message: "connection refused".to_string(),
            });
        }
        let transport = MockTransport::new(endpoint.address(), self.behaviour);
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// A pool over a usable mock transport
pub(crate) fn pool_for(endpoint: Endpoint) -> Arc<EndpointPool> {
    let transport = MockTransport::new(endpoint.address(), Behaviour::Usable);
    Arc::new(EndpointPool::new(endpoint, transport))
}

pub(crate) fn pools_for(addresses: &[&str]) -> Vec<Arc<EndpointPool>> {
    addresses
        .iter()
        .map(|address| pool_for(Endpoint::new(*address)))
        .collect()
}
