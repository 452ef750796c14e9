use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use lodestar_common::protocol::{
    ConnectionKey, Connector, Endpoint, LodestarError, RequestFrame, RequestId, ResponseFrame, Result,
};
use lodestar_common::trace;
use lodestar_common::transport::Transceiver;
use tracing::debug;

/// Established connections, keyed by endpoint, connector and connection id.
///
/// The registry is the only strong owner that outlives an exchange. Proxies
/// remember keys and look connections up again, so a removed connection turns
/// into a lookup miss rather than a dangling handle.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionKey, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionKey, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open connection registered under `key`.
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.lock()
            .get(key)
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    pub(crate) fn insert(&self, connection: Arc<Connection>) {
        self.lock().insert(connection.key().clone(), connection);
    }

    /// Removes `connection` unless its slot was already taken by a newer one.
    pub(crate) fn remove(&self, connection: &Arc<Connection>) {
        let mut connections = self.lock();
        if connections
            .get(connection.key())
            .is_some_and(|current| Arc::ptr_eq(current, connection))
        {
            connections.remove(connection.key());
        }
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Connection>> {
        self.lock().drain().map(|(_, connection)| connection).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// A live transport session bound to one [`ConnectionKey`].
///
/// Exchanges are serialized through an async mutex: one request and its reply
/// at a time. Any failure while exchanging closes the connection and removes
/// it from the registry.
pub struct Connection {
    key: ConnectionKey,
    transceiver: Arc<tokio::sync::Mutex<Box<dyn Transceiver>>>,
    closed: AtomicBool,
    registry: Weak<ConnectionRegistry>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        key: ConnectionKey,
        transceiver: Box<dyn Transceiver>,
        registry: &Arc<ConnectionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            transceiver: Arc::new(tokio::sync::Mutex::new(transceiver)),
            closed: AtomicBool::new(false),
            registry: Arc::downgrade(registry),
        })
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.key.endpoint
    }

    pub fn connector(&self) -> &Connector {
        &self.key.connector
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits for exclusive use of the connection.
    pub async fn exchange(self: &Arc<Self>) -> Result<Exchange> {
        if self.is_closed() {
            return Err(LodestarError::ConnectionLost(format!(
                "connection to {} is closed",
                self.key.connector
            )));
        }
        let guard = self.transceiver.clone().lock_owned().await;
        if self.is_closed() {
            return Err(LodestarError::ConnectionLost(format!(
                "connection to {} is closed",
                self.key.connector
            )));
        }
        Ok(Exchange {
            connection: self.clone(),
            transceiver: Some(guard),
            in_flight: false,
        })
    }

    /// Marks the connection closed, unregisters it and shuts the transceiver down.
    ///
    /// Holders of the connection see `ConnectionLost` on their next exchange.
    pub fn close(self: &Arc<Self>, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(target: trace::TRANSPORT, connection = %self.key, reason, "closing connection");
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self);
        }
        let transceiver = self.transceiver.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                transceiver.lock().await.close().await;
            });
        }
    }
}

/// Exclusive use of a connection for one request.
///
/// Dropping an exchange in the middle of a send, or after a twoway send
/// without reading the reply, closes the connection: the stream position is
/// no longer known.
pub struct Exchange {
    connection: Arc<Connection>,
    transceiver: Option<tokio::sync::OwnedMutexGuard<Box<dyn Transceiver>>>,
    in_flight: bool,
}

impl Exchange {
    fn fail(&mut self, error: LodestarError) -> LodestarError {
        self.transceiver = None;
        self.connection.close(&error.to_string());
        error
    }

    pub async fn send(&mut self, request: &RequestFrame) -> Result<()> {
        let Some(transceiver) = self.transceiver.as_mut() else {
            return Err(LodestarError::ConnectionGone);
        };
        self.in_flight = true;
        match transceiver.send(request).await {
            Ok(()) => {
                self.in_flight = !request.oneway;
                Ok(())
            }
            Err(error) => Err(self.fail(error)),
        }
    }

    /// Reads the reply to request `id`.
    pub async fn receive(&mut self, id: RequestId) -> Result<ResponseFrame> {
        let Some(transceiver) = self.transceiver.as_mut() else {
            return Err(LodestarError::ConnectionGone);
        };
        match transceiver.receive().await {
            Ok(response) if response.id == id => {
                self.in_flight = false;
                Ok(response)
            }
            Ok(response) => Err(self.fail(LodestarError::Protocol(format!(
                "expected reply to request {}, got {}",
                id, response.id
            )))),
            Err(error) => Err(self.fail(error)),
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if self.in_flight {
            self.transceiver = None;
            self.connection.close("exchange abandoned before its reply");
        }
    }
}
