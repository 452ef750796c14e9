use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lodestar_common::cancel::cancellable;
use lodestar_common::protocol::{
    ConnectionKey, Connector, Endpoint, InvocationFailure, LodestarError, Reference, RequestFrame, ResponseFrame,
    Result, RetryPolicy,
};
use lodestar_common::trace;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::communicator::Communicator;
use crate::connection::Connection;
use crate::interceptor::{Next, Terminal};
use crate::retry::AttemptOutcome;

/// Client-side handle on a remote object.
///
/// A proxy pairs a [`Reference`] with the [`Communicator`] that carries its
/// invocations. Clones share the cached connection.
#[derive(Clone)]
pub struct Proxy {
    communicator: Communicator,
    reference: Reference,
    cached: Arc<Mutex<Option<ConnectionKey>>>,
}

/// Bookkeeping carried across the attempts of one invocation.
#[derive(Default)]
struct AttemptState {
    endpoints: Option<Vec<Endpoint>>,
    /// The endpoints came from the locator cache rather than a live lookup.
    cached_endpoints: bool,
    /// Index of the endpoint the next attempt starts with.
    cursor: usize,
    excluded: Vec<Connector>,
    cleared_locator_cache: bool,
    endpoint: Option<Endpoint>,
    connector: Option<Connector>,
}

struct AttemptLoop<'a> {
    proxy: &'a Proxy,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl Terminal for AttemptLoop<'_> {
    async fn invoke(&self, request: RequestFrame) -> Result<Option<ResponseFrame>> {
        self.proxy.run_attempts(request, self.cancel).await
    }
}

impl Proxy {
    pub(crate) fn new(communicator: Communicator, reference: Reference) -> Self {
        Self {
            communicator,
            reference,
            cached: Arc::new(Mutex::new(None)),
        }
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    /// Proxy for a modified reference; returns a clone of `self` when nothing changed.
    pub fn with_reference(&self, reference: Reference) -> Proxy {
        if Reference::ptr_eq(&self.reference, &reference) {
            self.clone()
        } else {
            Proxy::new(self.communicator.clone(), reference)
        }
    }

    /// Builds a request addressed to this proxy's identity and facet.
    pub fn request(&self, operation: impl Into<String>, payload: Value) -> RequestFrame {
        RequestFrame::new(self.reference.identity().clone(), operation, payload).with_facet(self.reference.facet())
    }

    /// Invokes `operation` and returns the reply payload.
    ///
    /// Failure replies become [`LodestarError::RemoteFailure`]; oneway
    /// proxies return `Value::Null` once the request is sent.
    pub async fn call(&self, operation: impl Into<String>, payload: Value) -> Result<Value> {
        let request = self.request(operation, payload);
        match self.invoke(request, &CancellationToken::new()).await? {
            Some(response) if response.is_success() => Ok(response.payload),
            Some(response) => Err(LodestarError::RemoteFailure {
                status: response.status,
                payload: response.payload,
            }),
            None => Ok(Value::Null),
        }
    }

    /// Runs `request` through the interceptor chain and the attempt loop.
    ///
    /// Returns `None` for oneway and datagram invocations. A failure reply is
    /// returned as `Ok(Some(..))` when no further attempt was possible; local
    /// failures surface as [`LodestarError::Invocation`] describing the last
    /// attempt. Cancellation surfaces as a bare `Cancelled`.
    pub async fn invoke(&self, mut request: RequestFrame, cancel: &CancellationToken) -> Result<Option<ResponseFrame>> {
        self.communicator.check_disposed()?;
        let mode = self.reference.mode();
        if mode.is_batch() {
            return Err(LodestarError::FeatureNotSupported(
                "batch invocations".to_string(),
            ));
        }
        let endpoints = self.reference.endpoints();
        if mode.is_twoway() && !endpoints.is_empty() && endpoints.iter().all(Endpoint::is_datagram) {
            return Err(LodestarError::FeatureNotSupported(format!(
                "twoway invocation on datagram proxy {}",
                self.reference
            )));
        }
        request.oneway = !mode.is_twoway();

        let terminal = AttemptLoop { proxy: self, cancel };
        Next::new(&self.communicator.inner.interceptors, &terminal)
            .run(request)
            .await
    }

    /// Proxy bound to the connection this proxy currently uses, connecting
    /// first if needed.
    pub async fn fixed(&self, cancel: &CancellationToken) -> Result<Proxy> {
        self.communicator.check_disposed()?;
        let mut state = AttemptState::default();
        let connection = self.acquire_connection(&mut state, cancel).await?;
        let reference = Reference::fixed(self.reference.identity().clone(), connection.key().clone())
            .with_facet(self.reference.facet())
            .with_mode(self.reference.mode());
        Ok(Proxy::new(self.communicator.clone(), reference))
    }

    fn cached_key(&self) -> MutexGuard<'_, Option<ConnectionKey>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_locator_cache(&self) {
        if let Some(locator) = &self.communicator.inner.locator {
            locator.clear_cache(&self.reference);
        }
    }

    async fn run_attempts(&self, request: RequestFrame, cancel: &CancellationToken) -> Result<Option<ResponseFrame>> {
        let inner = &self.communicator.inner;
        let observer = &inner.observer;
        let operation = request.operation.as_str();
        let started = Instant::now();
        let max_attempts = self
            .reference
            .retry_max_attempts()
            .unwrap_or(inner.config.retry_max_attempts)
            .max(1);

        let size = request.payload_size()?;
        let (_reservation, release_after_sent) = match inner.retry_buffer.reserve(size) {
            Ok(reservation) => (Some(reservation), None),
            Err(limit) => (None, Some(limit)),
        };

        let mut state = AttemptState::default();
        let mut attempt = 1;
        let (last, policy) = loop {
            observer.attempt(operation, attempt);
            let mut sent = false;
            let work = self.attempt(&request, &mut state, &mut sent, cancel);
            let result = match inner.config.invocation_timeout {
                Some(limit) => match tokio::time::timeout(limit, cancellable(cancel, work)).await {
                    Ok(result) => result.and_then(|inner| inner),
                    Err(_) => Err(LodestarError::Timeout(limit)),
                },
                None => cancellable(cancel, work).await.and_then(|inner| inner),
            };

            let (last, mut policy) = match result {
                Ok(Some(response)) if !response.is_success() => {
                    observer.remote_failure(operation, response.status);
                    let policy = inner
                        .classifier
                        .classify(&AttemptOutcome::from_response(&response), attempt);
                    (Ok(response), policy)
                }
                Ok(reply) => {
                    observer.succeeded(operation, started.elapsed());
                    return Ok(reply);
                }
                Err(error) if error.is_cancelled() => {
                    debug!(target: trace::RETRY, operation, "invocation cancelled");
                    return Err(LodestarError::Cancelled);
                }
                Err(error) if matches!(error.root(), LodestarError::Disposed) => {
                    return Err(LodestarError::Disposed);
                }
                Err(error) => {
                    let outcome = AttemptOutcome::from_error(&error, sent, request.idempotent);
                    let policy = inner.classifier.classify(&outcome, attempt);
                    (Err(error), policy)
                }
            };

            // a missing object behind an indirect reference may just be stale locator data
            if let Ok(response) = &last {
                if policy == RetryPolicy::NoRetry
                    && response.status.is_not_exist()
                    && self.reference.is_indirect()
                    && !state.cleared_locator_cache
                {
                    debug!(target: trace::RETRY, operation, status = ?response.status, "retrying once with fresh locator data");
                    policy = RetryPolicy::Immediately;
                }
            }

            if sent && policy.is_retryable() {
                if let Some(limit) = release_after_sent {
                    warn!(
                        target: trace::RETRY,
                        operation,
                        attempt,
                        %policy,
                        reason = %limit,
                        "request failed with retryable failure but is not retryable because it was released after send"
                    );
                    break (last, policy);
                }
            }
            if !policy.is_retryable() {
                break (last, policy);
            }
            if attempt >= max_attempts {
                info!(
                    target: trace::RETRY,
                    operation,
                    attempt,
                    max_attempts,
                    %policy,
                    "request failed with retryable failure but it was the final attempt"
                );
                break (last, policy);
            }

            attempt += 1;
            if policy == RetryPolicy::OtherReplica {
                if let Some(connector) = state.connector.clone() {
                    debug!(target: trace::RETRY, %connector, "excluding connector");
                    state.excluded.push(connector);
                }
            }
            if self.reference.cache_connection() {
                self.cached_key().take();
            }
            if last.is_ok()
                && policy != RetryPolicy::OtherReplica
                && self.reference.is_indirect()
                && !state.cleared_locator_cache
            {
                self.clear_locator_cache();
                state.cleared_locator_cache = true;
                state.endpoints = None;
            }

            match &last {
                Ok(response) => info!(
                    target: trace::RETRY,
                    operation,
                    attempt,
                    max_attempts,
                    %policy,
                    status = ?response.status,
                    "retrying request after failure reply"
                ),
                Err(error) => info!(
                    target: trace::RETRY,
                    operation,
                    attempt,
                    max_attempts,
                    %policy,
                    %error,
                    "retrying request because of retryable failure"
                ),
            }

            if let Some(delay) = policy.delay() {
                self.retry_delay(delay, cancel).await?;
            }
            observer.retried(operation, policy);
        };

        match last {
            Ok(response) => {
                let error = LodestarError::RemoteFailure {
                    status: response.status,
                    payload: response.payload.clone(),
                };
                observer.failed(operation, started.elapsed(), &error);
                Ok(Some(response))
            }
            Err(error) => {
                let error = LodestarError::Invocation(Box::new(InvocationFailure {
                    operation: operation.to_string(),
                    error,
                    attempts: attempt,
                    endpoint: state.endpoint,
                    connector: state.connector,
                    last_policy: policy,
                }));
                observer.failed(operation, started.elapsed(), &error);
                debug!(target: trace::RETRY, %error, "invocation failed");
                Err(error)
            }
        }
    }

    /// Waits before the next attempt; shutting the communicator down ends the wait.
    async fn retry_delay(&self, delay: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LodestarError::Cancelled),
            _ = self.communicator.inner.shutdown.cancelled() => Err(LodestarError::Disposed),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// One physical attempt: obtain a connection, send, and await the reply.
    async fn attempt(
        &self,
        request: &RequestFrame,
        state: &mut AttemptState,
        sent: &mut bool,
        cancel: &CancellationToken,
    ) -> Result<Option<ResponseFrame>> {
        let connection = self.acquire_connection(state, cancel).await?;
        let mut exchange = connection.exchange().await?;
        exchange.send(request).await?;
        *sent = true;
        if request.oneway {
            return Ok(None);
        }
        exchange.receive(request.id).await.map(Some)
    }

    async fn acquire_connection(&self, state: &mut AttemptState, cancel: &CancellationToken) -> Result<Arc<Connection>> {
        let factory = &self.communicator.inner.factory;
        if let Some(key) = self.reference.fixed_connection() {
            state.endpoint = Some(key.endpoint.clone());
            state.connector = Some(key.connector.clone());
            return factory.get(key);
        }

        if self.reference.cache_connection() {
            let cached = self.cached_key().clone();
            if let Some(key) = cached {
                if let Some(connection) = factory.registry().get(&key) {
                    state.endpoint = Some(key.endpoint);
                    state.connector = Some(key.connector);
                    return Ok(connection);
                }
                self.cached_key().take();
            }
        }

        loop {
            let endpoints = if let Some(endpoints) = state.endpoints.clone() {
                endpoints
            } else {
                let (endpoints, cached) = self.endpoints(cancel).await?;
                state.endpoints = Some(endpoints.clone());
                state.cached_endpoints = cached;
                state.cursor = 0;
                endpoints
            };

            match self.connect_any(&endpoints, state, cancel).await {
                Ok(connection) => {
                    if self.reference.cache_connection() {
                        *self.cached_key() = Some(connection.key().clone());
                    }
                    return Ok(connection);
                }
                Err(error)
                    if !error.is_cancelled()
                        && self.reference.is_indirect()
                        && state.cached_endpoints
                        && !state.cleared_locator_cache =>
                {
                    info!(
                        target: trace::LOCATOR,
                        reference = %self.reference,
                        %error,
                        "cached endpoints unreachable, clearing locator cache"
                    );
                    self.clear_locator_cache();
                    state.cleared_locator_cache = true;
                    state.endpoints = None;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Tries each endpoint once, starting at the cursor.
    async fn connect_any(
        &self,
        endpoints: &[Endpoint],
        state: &mut AttemptState,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        if endpoints.is_empty() {
            return Err(LodestarError::NoEndpoint(self.reference.to_string()));
        }
        let factory = &self.communicator.inner.factory;
        let first = state.cursor % endpoints.len();
        let mut last_error = None;
        for offset in 0..endpoints.len() {
            let index = (first + offset) % endpoints.len();
            let endpoint = &endpoints[index];
            state.cursor = (index + 1) % endpoints.len();
            state.endpoint = Some(endpoint.clone());
            state.connector = None;

            match self.connect_endpoint(endpoint, state, cancel).await {
                Ok(connection) => return Ok(connection),
                Err(error) if error.is_cancelled() || matches!(error.root(), LodestarError::Disposed) => {
                    return Err(error)
                }
                Err(error) => {
                    if error.is_transport_failure() && !matches!(error.root(), LodestarError::Resolution { .. }) {
                        factory.record_failure(endpoint, None);
                    }
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| LodestarError::NoEndpoint(self.reference.to_string())))
    }

    async fn connect_endpoint(
        &self,
        endpoint: &Endpoint,
        state: &mut AttemptState,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        let factory = &self.communicator.inner.factory;
        let mut connectors = factory.connectors(endpoint, cancel).await?;
        connectors.retain(|connector| !state.excluded.contains(connector));
        let mut last_error = LodestarError::NoEndpoint(format!("{} (every connector excluded)", endpoint));
        for connector in &connectors {
            state.connector = Some(connector.clone());
            match factory
                .get_or_create(endpoint, connector, self.reference.connection_id(), cancel)
                .await
            {
                Ok(connection) => return Ok(connection),
                Err(error) if error.is_cancelled() || matches!(error.root(), LodestarError::Disposed) => {
                    return Err(error)
                }
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }

    /// Endpoints usable for this reference's invocation mode, recently failing ones last.
    async fn endpoints(&self, cancel: &CancellationToken) -> Result<(Vec<Endpoint>, bool)> {
        let inner = &self.communicator.inner;
        let (mut endpoints, cached) = if self.reference.is_indirect() {
            let locator = inner.locator.as_ref().ok_or_else(|| {
                LodestarError::NoEndpoint(format!("{} (no locator configured)", self.reference))
            })?;
            let resolution = locator.resolve(&self.reference, None, cancel).await?;
            (resolution.endpoints, resolution.cached)
        } else {
            (self.reference.endpoints().to_vec(), false)
        };

        let datagram = self.reference.mode().is_datagram();
        endpoints.retain(|endpoint| endpoint.is_datagram() == datagram);
        if endpoints.is_empty() {
            return Err(LodestarError::NoEndpoint(self.reference.to_string()));
        }
        inner.factory.order_endpoints(&mut endpoints);
        Ok((endpoints, cached))
    }
}
