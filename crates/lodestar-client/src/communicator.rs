use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lodestar_common::protocol::{LodestarError, Reference, Result};
use lodestar_common::transport::{TcpTransport, Transport};
use lodestar_common::InvocationConfig;
use lodestar_locator::{Locator, LocatorInfo};
use lodestar_metrics::{NullObserver, Observer};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::factory::ConnectionFactory;
use crate::interceptor::Interceptor;
use crate::proxy::Proxy;
use crate::retry::{RetryBuffer, RetryClassifier};

/// The context every proxy invokes through.
///
/// Owns the connection factory, the locator resolver, the retry buffer and
/// the interceptor chain. Cloning is cheap and shares all of them.
///
/// # Example
///
/// ```no_run
/// use lodestar_client::Communicator;
/// use lodestar_common::{Endpoint, Reference};
/// use serde_json::json;
///
/// # async fn example() -> lodestar_common::Result<()> {
/// let communicator = Communicator::builder().build();
/// let proxy = communicator.proxy(Reference::direct("printer", vec![Endpoint::tcp("127.0.0.1", 10000)]));
/// let reply = proxy.call("print", json!({"doc": "a.txt"})).await?;
/// println!("{}", reply);
/// communicator.shutdown();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Communicator {
    pub(crate) inner: Arc<CommunicatorInner>,
}

pub(crate) struct CommunicatorInner {
    pub(crate) config: InvocationConfig,
    pub(crate) factory: ConnectionFactory,
    pub(crate) locator: Option<LocatorInfo>,
    pub(crate) observer: Arc<dyn Observer>,
    pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) retry_buffer: Arc<RetryBuffer>,
    pub(crate) classifier: RetryClassifier,
    /// Cancels retry delays when the communicator shuts down.
    pub(crate) shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl Communicator {
    pub fn builder() -> CommunicatorBuilder {
        CommunicatorBuilder::default()
    }

    pub fn config(&self) -> &InvocationConfig {
        &self.inner.config
    }

    pub fn connection_factory(&self) -> &ConnectionFactory {
        &self.inner.factory
    }

    pub fn locator_info(&self) -> Option<&LocatorInfo> {
        self.inner.locator.as_ref()
    }

    pub fn retry_buffer(&self) -> &RetryBuffer {
        &self.inner.retry_buffer
    }

    /// Creates a proxy for `reference`.
    pub fn proxy(&self, reference: Reference) -> Proxy {
        Proxy::new(self.clone(), reference)
    }

    pub(crate) fn check_disposed(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            Err(LodestarError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Closes every connection and fails later invocations with `Disposed`.
    pub fn shutdown(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down communicator");
        self.inner.shutdown.cancel();
        self.inner.factory.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

/// Builder for [`Communicator`].
///
/// Defaults to the TCP transport, no locator and no observer.
pub struct CommunicatorBuilder {
    config: InvocationConfig,
    transport: Option<Arc<dyn Transport>>,
    locator: Option<Arc<dyn Locator>>,
    observer: Arc<dyn Observer>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Default for CommunicatorBuilder {
    fn default() -> Self {
        Self {
            config: InvocationConfig::default(),
            transport: None,
            locator: None,
            observer: Arc::new(NullObserver),
            interceptors: Vec::new(),
        }
    }
}

impl CommunicatorBuilder {
    pub fn config(mut self, config: InvocationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn locator(mut self, locator: Arc<dyn Locator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Appends an interceptor; interceptors run in the order they were added.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> Communicator {
        let config = self.config;
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(TcpTransport::new().with_connect_timeout(config.connect_timeout))
        });
        let factory = ConnectionFactory::new(transport, self.observer.clone(), config.transport_failure_ttl);
        let locator = self.locator.map(|locator| LocatorInfo::new(locator, &config));
        let retry_buffer = RetryBuffer::new(config.retry_buffer_size_max, config.retry_request_size_max);
        let classifier = RetryClassifier::new(&config.retry_intervals);

        Communicator {
            inner: Arc::new(CommunicatorInner {
                config,
                factory,
                locator,
                observer: self.observer,
                interceptors: self.interceptors,
                retry_buffer,
                classifier,
                shutdown: CancellationToken::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }
}
