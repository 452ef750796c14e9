use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lodestar_common::protocol::{ConnectionKey, Connector, Endpoint, LodestarError, Result};
use lodestar_common::single_flight::SingleFlight;
use lodestar_common::trace;
use lodestar_common::transport::Transport;
use lodestar_metrics::Observer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionRegistry};
use crate::failures::TransportFailures;

/// Opens and reuses connections for the invocation engine.
///
/// Concurrent requests for the same key share a single connect. Every failed
/// connect or name lookup lands in the transport-failure table, which then
/// pushes the failing endpoint or connector to the back of later candidate
/// lists.
#[derive(Clone)]
pub struct ConnectionFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    transport: Arc<dyn Transport>,
    observer: Arc<dyn Observer>,
    registry: Arc<ConnectionRegistry>,
    pending: Arc<SingleFlight<ConnectionKey, Arc<Connection>>>,
    failures: TransportFailures,
    disposed: AtomicBool,
}

impl ConnectionFactory {
    pub fn new(transport: Arc<dyn Transport>, observer: Arc<dyn Observer>, failure_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                transport,
                observer,
                registry: ConnectionRegistry::new(),
                pending: SingleFlight::new(),
                failures: TransportFailures::new(failure_ttl),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn failures(&self) -> &TransportFailures {
        &self.inner.failures
    }

    fn check_disposed(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            Err(LodestarError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Resolves `endpoint` into connectors, recently failing ones last.
    pub async fn connectors(&self, endpoint: &Endpoint, cancel: &CancellationToken) -> Result<Vec<Connector>> {
        self.check_disposed()?;
        let resolved = lodestar_common::cancel::cancellable(cancel, self.inner.transport.connectors(endpoint)).await?;
        match resolved {
            Ok(mut connectors) => {
                self.inner.failures.order_connectors(&mut connectors);
                Ok(connectors)
            }
            Err(error) => {
                debug!(target: trace::TRANSPORT, endpoint = %endpoint, error = %error, "failed to resolve endpoint");
                self.inner.failures.record(endpoint, None);
                Err(error)
            }
        }
    }

    /// Reorders `endpoints` so recently failing ones come last.
    pub fn order_endpoints(&self, endpoints: &mut [Endpoint]) {
        self.inner.failures.order_endpoints(endpoints);
    }

    pub fn record_failure(&self, endpoint: &Endpoint, connector: Option<&Connector>) {
        self.inner.failures.record(endpoint, connector);
    }

    /// Connection registered under `key`, or `ConnectionGone`.
    pub fn get(&self, key: &ConnectionKey) -> Result<Arc<Connection>> {
        self.check_disposed()?;
        self.inner.registry.get(key).ok_or(LodestarError::ConnectionGone)
    }

    /// Returns the open connection for this endpoint and connector, connecting
    /// if there is none.
    ///
    /// A cancelled caller stops waiting; a connect already under way completes
    /// and registers its connection for the next caller.
    pub async fn get_or_create(
        &self,
        endpoint: &Endpoint,
        connector: &Connector,
        connection_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        self.check_disposed()?;
        let key = ConnectionKey {
            endpoint: endpoint.clone(),
            connector: connector.clone(),
            connection_id: connection_id.to_string(),
        };
        if let Some(connection) = self.inner.registry.get(&key) {
            return Ok(connection);
        }

        let inner = self.inner.clone();
        let flight_key = key.clone();
        self.inner
            .pending
            .run(key, move || async move { inner.connect(flight_key).await }, cancel)
            .await
    }

    /// Closes every registered connection; later requests fail with `Disposed`.
    pub fn shutdown(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections = self.inner.registry.drain();
        debug!(target: trace::TRANSPORT, count = connections.len(), "closing all connections");
        for connection in connections {
            connection.close("communicator shut down");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }
}

impl FactoryInner {
    async fn connect(&self, key: ConnectionKey) -> Result<Arc<Connection>> {
        if let Some(connection) = self.registry.get(&key) {
            return Ok(connection);
        }
        debug!(target: trace::TRANSPORT, endpoint = %key.endpoint, connector = %key.connector, "establishing connection");
        match self.transport.open(&key.endpoint, &key.connector).await {
            Ok(transceiver) => {
                let connection = Connection::new(key, transceiver, &self.registry);
                if self.disposed.load(Ordering::Acquire) {
                    connection.close("communicator shut down");
                    return Err(LodestarError::Disposed);
                }
                self.registry.insert(connection.clone());
                self.observer
                    .connection_established(connection.endpoint(), connection.connector());
                Ok(connection)
            }
            Err(error) => {
                warn!(
                    target: trace::TRANSPORT,
                    endpoint = %key.endpoint,
                    connector = %key.connector,
                    error = %error,
                    "connection establishment failed"
                );
                self.failures.record(&key.endpoint, Some(&key.connector));
                self.observer
                    .connection_failed(&key.endpoint, &key.connector, &error);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::MockTransport;
    use lodestar_metrics::NullObserver;

    fn factory(transport: Arc<MockTransport>) -> ConnectionFactory {
        ConnectionFactory::new(transport, Arc::new(NullObserver), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let transport = MockTransport::new();
        let factory = factory(transport.clone());
        let endpoint = Endpoint::tcp("h1", 10000);
        let token = CancellationToken::new();

        let connectors = factory.connectors(&endpoint, &token).await.unwrap();
        let first = factory
            .get_or_create(&endpoint, &connectors[0], "", &token)
            .await
            .unwrap();
        let second = factory
            .get_or_create(&endpoint, &connectors[0], "", &token)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.opens(), 1);
        assert_eq!(factory.connection_count(), 1);

        // a different connection id gets its own connection
        factory
            .get_or_create(&endpoint, &connectors[0], "isolated", &token)
            .await
            .unwrap();
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_connects_are_shared() {
        let transport = MockTransport::new().with_connect_delay(Duration::from_millis(20));
        let factory = factory(transport.clone());
        let endpoint = Endpoint::tcp("h1", 10000);
        let token = CancellationToken::new();
        let connector = factory.connectors(&endpoint, &token).await.unwrap().remove(0);

        let attempts = (0..8).map(|_| factory.get_or_create(&endpoint, &connector, "", &token));
        let connections = futures::future::join_all(attempts).await;
        assert!(connections.iter().all(|c| c.is_ok()));
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_is_recorded() {
        let transport = MockTransport::new().with_addresses("h1", 2).refuse("h1", 0);
        let factory = factory(transport.clone());
        let endpoint = Endpoint::tcp("h1", 10000);
        let token = CancellationToken::new();

        let connectors = factory.connectors(&endpoint, &token).await.unwrap();
        let error = factory
            .get_or_create(&endpoint, &connectors[0], "", &token)
            .await
            .unwrap_err();
        assert!(error.is_connect_failure());
        assert!(factory.failures().has_failed_connector(&connectors[0]));

        // the failing connector now sorts last
        let reordered = factory.connectors(&endpoint, &token).await.unwrap();
        assert_eq!(reordered[1], connectors[0]);
    }

    #[tokio::test]
    async fn test_unresolvable_endpoint_is_recorded() {
        let transport = MockTransport::new();
        let factory = factory(transport);
        let endpoint = Endpoint::tcp("nowhere", 10000);
        let error = factory
            .connectors(&endpoint, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, LodestarError::Resolution { .. }));
        assert!(factory.failures().has_failed_endpoint(&endpoint));
    }

    #[tokio::test]
    async fn test_closed_connection_turns_into_lookup_miss() {
        let transport = MockTransport::new();
        let factory = factory(transport);
        let endpoint = Endpoint::tcp("h1", 10000);
        let token = CancellationToken::new();
        let connector = factory.connectors(&endpoint, &token).await.unwrap().remove(0);
        let connection = factory
            .get_or_create(&endpoint, &connector, "", &token)
            .await
            .unwrap();
        let key = connection.key().clone();
        assert!(factory.get(&key).is_ok());

        connection.close("test");
        assert!(matches!(factory.get(&key), Err(LodestarError::ConnectionGone)));
        assert!(matches!(
            connection.exchange().await,
            Err(LodestarError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_disposes_factory() {
        let transport = MockTransport::new();
        let factory = factory(transport);
        let endpoint = Endpoint::tcp("h1", 10000);
        let token = CancellationToken::new();
        let connector = factory.connectors(&endpoint, &token).await.unwrap().remove(0);
        let connection = factory
            .get_or_create(&endpoint, &connector, "", &token)
            .await
            .unwrap();

        factory.shutdown();
        assert!(connection.is_closed());
        assert_eq!(factory.connection_count(), 0);
        assert!(matches!(
            factory.get_or_create(&endpoint, &connector, "", &token).await,
            Err(LodestarError::Disposed)
        ));
    }
}
