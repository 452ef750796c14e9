//! Invocation engine tests against an in-memory transport.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lodestar_common::protocol::{
    Connector, Endpoint, Identity, LodestarError, ReplyStatus, RequestFrame, RequestId, ResponseFrame, Result,
    RetryPolicy,
};
use lodestar_common::transport::{Transceiver, Transport};
use lodestar_locator::Locator;
use lodestar_metrics::Observer;
use serde_json::{json, Value};

/// What the transport does with the next request written to it.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    Echo,
    /// The write fails; nothing reaches the peer.
    FailSend,
    /// The write succeeds, then the connection drops.
    LoseReply,
    /// The write succeeds, then the peer sends a close notice without
    /// dispatching the request.
    CloseNotice,
    Reply(ReplyStatus, Option<RetryPolicy>),
    /// The write succeeds and no reply ever comes.
    Stall,
}

#[derive(Default)]
struct Shared {
    scripts: Mutex<VecDeque<Script>>,
    sends: AtomicUsize,
    sent_to: Mutex<Vec<String>>,
}

/// Transport over imaginary hosts. `nowhere` does not resolve; every other
/// host resolves to `10.0.0.1` and up.
pub(crate) struct MockTransport {
    shared: Arc<Shared>,
    addresses: Mutex<HashMap<String, u8>>,
    refused: Mutex<HashSet<(String, u8)>>,
    connect_delay: Mutex<Duration>,
    opens: AtomicUsize,
    connects: Mutex<Vec<Connector>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared::default()),
            addresses: Mutex::new(HashMap::new()),
            refused: Mutex::new(HashSet::new()),
            connect_delay: Mutex::new(Duration::ZERO),
            opens: AtomicUsize::new(0),
            connects: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn with_addresses(self: Arc<Self>, host: &str, count: u8) -> Arc<Self> {
        self.addresses.lock().unwrap().insert(host.to_string(), count);
        self
    }

    /// Refuses connections to address `index` (0-based) of `host`.
    pub(crate) fn refuse(self: Arc<Self>, host: &str, index: u8) -> Arc<Self> {
        self.refused.lock().unwrap().insert((host.to_string(), index));
        self
    }

    pub(crate) fn with_connect_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.connect_delay.lock().unwrap() = delay;
        self
    }

    pub(crate) fn script(&self, script: Script) {
        self.shared.scripts.lock().unwrap().push_back(script);
    }

    pub(crate) fn script_n(&self, script: Script, count: usize) {
        for _ in 0..count {
            self.script(script.clone());
        }
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Requests that reached a peer.
    pub(crate) fn sends(&self) -> usize {
        self.shared.sends.load(Ordering::SeqCst)
    }

    pub(crate) fn sent_to(&self) -> Vec<String> {
        self.shared.sent_to.lock().unwrap().clone()
    }

    /// Every connector an open was attempted on, in order.
    pub(crate) fn connect_attempts(&self) -> Vec<Connector> {
        self.connects.lock().unwrap().clone()
    }

    pub(crate) fn connect_hosts(&self) -> Vec<String> {
        self.connect_attempts().into_iter().map(|c| c.host).collect()
    }
}

fn address_index(connector: &Connector) -> u8 {
    match connector.addr.ip() {
        IpAddr::V4(ip) => ip.octets()[3] - 1,
        IpAddr::V6(_) => 0,
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connectors(&self, endpoint: &Endpoint) -> Result<Vec<Connector>> {
        if endpoint.host == "nowhere" {
            return Err(LodestarError::Resolution {
                host: endpoint.host.clone(),
                reason: "host not found".to_string(),
            });
        }
        let count = self
            .addresses
            .lock()
            .unwrap()
            .get(&endpoint.host)
            .copied()
            .unwrap_or(1);
        Ok((1..=count)
            .map(|last| {
                Connector::new(
                    endpoint.transport,
                    SocketAddr::from(([10, 0, 0, last], endpoint.port)),
                    endpoint.host.clone(),
                )
            })
            .collect())
    }

    async fn open(&self, _endpoint: &Endpoint, connector: &Connector) -> Result<Box<dyn Transceiver>> {
        self.connects.lock().unwrap().push(connector.clone());
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let refused = self
            .refused
            .lock()
            .unwrap()
            .contains(&(connector.host.clone(), address_index(connector)));
        if refused {
            return Err(LodestarError::ConnectFailed(connector.to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransceiver {
            shared: self.shared.clone(),
            host: connector.host.clone(),
            pending: None,
        }))
    }
}

struct MockTransceiver {
    shared: Arc<Shared>,
    host: String,
    pending: Option<(RequestId, Script, Value)>,
}

#[async_trait]
impl Transceiver for MockTransceiver {
    async fn send(&mut self, request: &RequestFrame) -> Result<()> {
        let script = self
            .shared
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Echo);
        if let Script::FailSend = script {
            return Err(LodestarError::ConnectionLost(
                "reset before the request was written".to_string(),
            ));
        }
        self.shared.sends.fetch_add(1, Ordering::SeqCst);
        self.shared.sent_to.lock().unwrap().push(self.host.clone());
        self.pending = Some((request.id, script, request.payload.clone()));
        Ok(())
    }

    async fn receive(&mut self) -> Result<ResponseFrame> {
        let Some((id, script, payload)) = self.pending.take() else {
            return Err(LodestarError::Protocol("no request pending".to_string()));
        };
        match script {
            Script::Echo | Script::FailSend => Ok(ResponseFrame::success(
                id,
                json!({ "host": self.host, "echo": payload }),
            )),
            Script::LoseReply => Err(LodestarError::ConnectionLost("reset by peer".to_string())),
            Script::CloseNotice => Err(LodestarError::ConnectionClosed { by_peer: true }),
            Script::Reply(status, hint) => {
                let mut response = ResponseFrame::failure(id, status, Value::Null);
                response.retry_policy = hint;
                Ok(response)
            }
            Script::Stall => std::future::pending().await,
        }
    }

    async fn close(&mut self) {}
}

#[derive(Default)]
pub(crate) struct CountingObserver {
    attempts: AtomicU32,
    retried: AtomicU32,
    succeeded: AtomicU32,
    failed: AtomicU32,
    established: AtomicU32,
    connect_failures: AtomicU32,
}

impl CountingObserver {
    fn get(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

impl Observer for CountingObserver {
    fn connection_established(&self, _endpoint: &Endpoint, _connector: &Connector) {
        self.established.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_failed(&self, _endpoint: &Endpoint, _connector: &Connector, _error: &LodestarError) {
        self.connect_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn attempt(&self, _operation: &str, _attempt: u32) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    fn retried(&self, _operation: &str, _policy: RetryPolicy) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn succeeded(&self, _operation: &str, _elapsed: Duration) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
    }

    fn failed(&self, _operation: &str, _elapsed: Duration, _error: &LodestarError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Locator answering `resolve_location` from a queue; the last answer repeats.
pub(crate) struct StaticLocator {
    answers: Mutex<VecDeque<Vec<Endpoint>>>,
    calls: AtomicUsize,
}

impl StaticLocator {
    pub(crate) fn new(answers: Vec<Vec<Endpoint>>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Locator for StaticLocator {
    async fn find_adapter_by_id(&self, _adapter_id: &str) -> Result<Option<lodestar_common::Reference>> {
        Ok(None)
    }

    async fn find_object_by_id(&self, _identity: &Identity, _facet: &str) -> Result<Option<lodestar_common::Reference>> {
        Ok(None)
    }

    async fn resolve_location(&self, _location: &[String]) -> Result<Vec<Endpoint>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.answers.lock().unwrap();
        if answers.len() > 1 {
            Ok(answers.pop_front().unwrap_or_default())
        } else {
            Ok(answers.front().cloned().unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Communicator, Interceptor, Next};
    use lodestar_common::protocol::{InvocationMode, Protocol, Reference, TransportKind};
    use lodestar_common::InvocationConfig;
    use lodestar_locator::LocationKey;
    use tokio_util::sync::CancellationToken;

    fn communicator(transport: &Arc<MockTransport>, config: InvocationConfig) -> Communicator {
        Communicator::builder()
            .config(config)
            .transport(transport.clone())
            .build()
    }

    fn direct(hosts: &[&str]) -> Reference {
        Reference::direct(
            "printer",
            hosts.iter().map(|host| Endpoint::tcp(*host, 10000)).collect(),
        )
    }

    fn invocation_failure(error: &LodestarError) -> &lodestar_common::InvocationFailure {
        match error {
            LodestarError::Invocation(failure) => failure,
            other => panic!("expected an invocation failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_reuses_connection() {
        let transport = MockTransport::new();
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(direct(&["h1"]));

        let reply = proxy.call("print", json!("a.txt")).await.unwrap();
        assert_eq!(reply["host"], "h1");
        assert_eq!(reply["echo"], "a.txt");

        proxy.call("print", json!("b.txt")).await.unwrap();
        assert_eq!(transport.opens(), 1);
        assert_eq!(transport.sends(), 2);
        assert_eq!(communicator.retry_buffer().used(), 0);
    }

    #[tokio::test]
    async fn test_failed_connector_falls_through_to_next() {
        let transport = MockTransport::new().with_addresses("h1", 2).refuse("h1", 0);
        let observer = Arc::new(CountingObserver::default());
        let communicator = Communicator::builder()
            .transport(transport.clone())
            .observer(observer.clone())
            .build();
        let proxy = communicator.proxy(direct(&["h1"]));

        proxy.call("print", Value::Null).await.unwrap();

        let attempted = transport.connect_attempts();
        assert_eq!(attempted.len(), 2);
        let failures = communicator.connection_factory().failures();
        assert!(failures.has_failed_connector(&attempted[0]));
        assert!(!failures.has_failed_connector(&attempted[1]));
        assert_eq!(transport.sends(), 1);
        assert_eq!(CountingObserver::get(&observer.attempts), 1);
        assert_eq!(CountingObserver::get(&observer.connect_failures), 1);
        assert_eq!(CountingObserver::get(&observer.established), 1);
    }

    #[tokio::test]
    async fn test_non_idempotent_request_not_resent_after_send() {
        let transport = MockTransport::new();
        transport.script(Script::LoseReply);
        let observer = Arc::new(CountingObserver::default());
        let communicator = Communicator::builder()
            .transport(transport.clone())
            .observer(observer.clone())
            .build();
        let proxy = communicator.proxy(direct(&["h1"]));

        let request = proxy.request("writeRecord", json!({ "id": 7 }));
        let error = proxy
            .invoke(request, &CancellationToken::new())
            .await
            .unwrap_err();

        let failure = invocation_failure(&error);
        assert!(matches!(failure.error.root(), LodestarError::ConnectionLost(_)));
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.last_policy, RetryPolicy::NoRetry);
        assert_eq!(failure.endpoint.as_ref().map(|e| e.host.as_str()), Some("h1"));
        assert_eq!(transport.sends(), 1);
        assert_eq!(CountingObserver::get(&observer.attempts), 1);
        assert_eq!(CountingObserver::get(&observer.retried), 0);
        assert_eq!(CountingObserver::get(&observer.failed), 1);
    }

    #[tokio::test]
    async fn test_idempotent_request_retried_after_failed_send() {
        let transport = MockTransport::new();
        transport.script(Script::FailSend);
        let observer = Arc::new(CountingObserver::default());
        let communicator = Communicator::builder()
            .transport(transport.clone())
            .observer(observer.clone())
            .build();
        let proxy = communicator.proxy(direct(&["h1"]));

        let request = proxy.request("readRecord", json!({ "id": 7 })).idempotent();
        let response = proxy
            .invoke(request, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert!(response.is_success());
        assert_eq!(CountingObserver::get(&observer.attempts), 2);
        assert_eq!(CountingObserver::get(&observer.retried), 1);
        assert_eq!(transport.sends(), 1);
        // the failed send closed the first connection
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn test_unsent_non_idempotent_request_is_retried() {
        let transport = MockTransport::new();
        transport.script(Script::FailSend);
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(direct(&["h1"]));

        proxy.call("writeRecord", json!(1)).await.unwrap();
        assert_eq!(transport.sends(), 1);
    }

    #[tokio::test]
    async fn test_idempotent_request_resent_after_lost_reply() {
        let transport = MockTransport::new();
        transport.script(Script::LoseReply);
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(direct(&["h1"]));

        let request = proxy.request("readRecord", Value::Null).idempotent();
        let response = proxy.invoke(request, &CancellationToken::new()).await.unwrap();
        assert!(response.unwrap().is_success());
        assert_eq!(transport.sends(), 2);
    }

    #[tokio::test]
    async fn test_close_notice_allows_resend_of_non_idempotent_request() {
        let transport = MockTransport::new();
        transport.script(Script::CloseNotice);
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(direct(&["h1"]));

        proxy.call("writeRecord", json!(1)).await.unwrap();
        assert_eq!(transport.sends(), 2);
        assert_eq!(transport.connect_hosts(), vec!["h1", "h1"]);
    }

    #[tokio::test]
    async fn test_endpoints_tried_round_robin_across_retries() {
        let transport = MockTransport::new();
        transport.script_n(Script::FailSend, 5);
        let config = InvocationConfig::default().with_retry_max_attempts(6);
        let communicator = communicator(&transport, config);
        let proxy = communicator.proxy(direct(&["h1", "h2", "h3"]));

        let reply = proxy.call("print", Value::Null).await.unwrap();
        assert_eq!(reply["host"], "h3");
        assert_eq!(
            transport.connect_hosts(),
            vec!["h1", "h2", "h3", "h1", "h2", "h3"]
        );
        assert_eq!(transport.sent_to(), vec!["h3"]);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let transport = MockTransport::new();
        transport.script_n(Script::FailSend, 3);
        let config = InvocationConfig::default().with_retry_max_attempts(3);
        let communicator = communicator(&transport, config);
        let proxy = communicator.proxy(direct(&["h1"]));

        let request = proxy.request("readRecord", Value::Null).idempotent();
        let error = proxy
            .invoke(request, &CancellationToken::new())
            .await
            .unwrap_err();
        let failure = invocation_failure(&error);
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.last_policy, RetryPolicy::Immediately);
        assert!(failure.connector.is_some());
        assert_eq!(transport.sends(), 0);
    }

    #[tokio::test]
    async fn test_per_reference_attempt_limit_overrides_config() {
        let transport = MockTransport::new();
        transport.script_n(Script::FailSend, 5);
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(direct(&["h1"]).with_retry_max_attempts(2));

        let error = proxy.call("print", Value::Null).await.unwrap_err();
        assert_eq!(invocation_failure(&error).attempts, 2);
    }

    #[tokio::test]
    async fn test_oversized_request_is_not_retried_after_send() {
        let transport = MockTransport::new();
        transport.script(Script::FailSend);
        transport.script(Script::LoseReply);
        let config = InvocationConfig::default().with_retry_request_size_max(8);
        let communicator = communicator(&transport, config);
        let proxy = communicator.proxy(direct(&["h1"]));

        let request = proxy
            .request("upload", json!("a payload well over eight bytes"))
            .idempotent();
        let error = proxy
            .invoke(request, &CancellationToken::new())
            .await
            .unwrap_err();

        // the unsent first attempt could still be retried, the sent one not
        let failure = invocation_failure(&error);
        assert_eq!(failure.attempts, 2);
        assert!(failure.last_policy.is_retryable());
        assert_eq!(transport.sends(), 1);
        assert_eq!(communicator.retry_buffer().used(), 0);
    }

    #[tokio::test]
    async fn test_interceptors_run_once_in_order() {
        struct Recording {
            name: &'static str,
            log: Arc<Mutex<Vec<&'static str>>>,
        }

        #[async_trait]
        impl Interceptor for Recording {
            async fn intercept(&self, request: RequestFrame, next: Next<'_>) -> Result<Option<ResponseFrame>> {
                self.log.lock().unwrap().push(self.name);
                next.run(request.with_context("seen-by", self.name)).await
            }
        }

        let transport = MockTransport::new();
        transport.script(Script::FailSend);
        let log = Arc::new(Mutex::new(Vec::new()));
        let observer = Arc::new(CountingObserver::default());
        let communicator = Communicator::builder()
            .transport(transport.clone())
            .observer(observer.clone())
            .interceptor(Arc::new(Recording {
                name: "outer",
                log: log.clone(),
            }))
            .interceptor(Arc::new(Recording {
                name: "inner",
                log: log.clone(),
            }))
            .build();
        let proxy = communicator.proxy(direct(&["h1"]));

        proxy.call("print", Value::Null).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
        assert_eq!(CountingObserver::get(&observer.attempts), 2);
    }

    #[tokio::test]
    async fn test_interceptor_can_answer_without_io() {
        struct Canned;

        #[async_trait]
        impl Interceptor for Canned {
            async fn intercept(&self, request: RequestFrame, _next: Next<'_>) -> Result<Option<ResponseFrame>> {
                Ok(Some(ResponseFrame::success(request.id, json!("cached"))))
            }
        }

        let transport = MockTransport::new();
        let communicator = Communicator::builder()
            .transport(transport.clone())
            .interceptor(Arc::new(Canned))
            .build();
        let proxy = communicator.proxy(direct(&["h1"]));

        assert_eq!(proxy.call("print", Value::Null).await.unwrap(), "cached");
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_wrapped() {
        let transport = MockTransport::new();
        transport.script(Script::Stall);
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(direct(&["h1"]));

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let request = proxy.request("readRecord", Value::Null).idempotent();
        let error = proxy.invoke(request, &token).await.unwrap_err();
        assert!(matches!(error, LodestarError::Cancelled));
        assert_eq!(transport.sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invocation_timeout_applies_per_attempt() {
        let transport = MockTransport::new();
        let config = InvocationConfig::default().with_invocation_timeout(Duration::from_millis(100));
        let communicator = communicator(&transport, config);
        let proxy = communicator.proxy(direct(&["h1"]));

        transport.script(Script::Stall);
        let error = proxy.call("writeRecord", Value::Null).await.unwrap_err();
        let failure = invocation_failure(&error);
        assert!(matches!(failure.error, LodestarError::Timeout(_)));
        assert_eq!(failure.attempts, 1);
        assert_eq!(transport.sends(), 1);

        transport.script(Script::Stall);
        let request = proxy.request("readRecord", Value::Null).idempotent();
        let response = proxy.invoke(request, &CancellationToken::new()).await.unwrap();
        assert!(response.unwrap().is_success());
        assert_eq!(transport.sends(), 3);
    }

    #[tokio::test]
    async fn test_oneway_returns_after_send() {
        let transport = MockTransport::new();
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(direct(&["h1"]).with_mode(InvocationMode::Oneway));

        let request = proxy.request("log", json!("started"));
        let reply = proxy.invoke(request, &CancellationToken::new()).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(proxy.call("log", json!("again")).await.unwrap(), Value::Null);
        assert_eq!(transport.sends(), 2);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_modes_fail_before_io() {
        let transport = MockTransport::new();
        let communicator = communicator(&transport, InvocationConfig::default());

        let batch = communicator.proxy(direct(&["h1"]).with_mode(InvocationMode::BatchOneway));
        assert!(matches!(
            batch.call("log", Value::Null).await,
            Err(LodestarError::FeatureNotSupported(_))
        ));

        let udp = Reference::direct("printer", vec![Endpoint::new(TransportKind::Udp, "h1", 10000)]);
        let twoway_over_udp = communicator.proxy(udp);
        assert!(matches!(
            twoway_over_udp.call("print", Value::Null).await,
            Err(LodestarError::FeatureNotSupported(_))
        ));
        assert!(transport.connect_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_fixed_proxy_uses_only_its_connection() {
        let transport = MockTransport::new();
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(direct(&["h1"]));

        let fixed = proxy.fixed(&CancellationToken::new()).await.unwrap();
        assert!(fixed.reference().is_fixed());
        fixed.call("print", json!(1)).await.unwrap();
        assert_eq!(transport.opens(), 1);

        let key = fixed.reference().fixed_connection().unwrap().clone();
        communicator
            .connection_factory()
            .get(&key)
            .unwrap()
            .close("test");

        let error = fixed.call("print", json!(2)).await.unwrap_err();
        assert!(matches!(error.root(), LodestarError::ConnectionGone));
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn test_other_replica_hint_excludes_connector() {
        let transport = MockTransport::new().with_addresses("h1", 2);
        transport.script(Script::Reply(
            ReplyStatus::UserException,
            Some(RetryPolicy::OtherReplica),
        ));
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(direct(&["h1"]));

        proxy.call("print", Value::Null).await.unwrap();

        let addresses: Vec<_> = transport
            .connect_attempts()
            .iter()
            .map(|c| c.addr.to_string())
            .collect();
        assert_eq!(addresses, vec!["10.0.0.1:10000", "10.0.0.2:10000"]);
        assert_eq!(transport.sends(), 2);
    }

    #[tokio::test]
    async fn test_failure_reply_without_hint_is_final() {
        let transport = MockTransport::new();
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(direct(&["h1"]));

        transport.script(Script::Reply(ReplyStatus::UserException, None));
        let request = proxy.request("print", Value::Null);
        let response = proxy
            .invoke(request, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, ReplyStatus::UserException);

        // a direct reference gets no second chance for a missing object
        transport.script(Script::Reply(ReplyStatus::ObjectNotExist, None));
        let error = proxy.call("print", Value::Null).await.unwrap_err();
        assert!(matches!(
            error,
            LodestarError::RemoteFailure {
                status: ReplyStatus::ObjectNotExist,
                ..
            }
        ));
        assert_eq!(transport.sends(), 2);
    }

    #[tokio::test]
    async fn test_delayed_retry_hint_waits() {
        let transport = MockTransport::new();
        transport.script(Script::Reply(
            ReplyStatus::UnknownException,
            Some(RetryPolicy::AfterDelay(Duration::from_millis(30))),
        ));
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(direct(&["h1"]));

        let started = tokio::time::Instant::now();
        proxy.call("print", Value::Null).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(transport.sends(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_retry_delay() {
        let transport = MockTransport::new();
        transport.script(Script::FailSend);
        let config = InvocationConfig::default().with_retry_intervals(vec![60_000]);
        let communicator = communicator(&transport, config);
        let proxy = communicator.proxy(direct(&["h1"]));

        let closer = communicator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.shutdown();
        });

        let error = proxy.call("print", Value::Null).await.unwrap_err();
        assert!(matches!(error, LodestarError::Disposed));
        assert!(matches!(
            proxy.call("print", Value::Null).await,
            Err(LodestarError::Disposed)
        ));
        assert_eq!(communicator.connection_factory().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unresolvable_endpoint_is_skipped() {
        let transport = MockTransport::new();
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(direct(&["nowhere", "h1"]));

        let reply = proxy.call("print", Value::Null).await.unwrap();
        assert_eq!(reply["host"], "h1");
        assert!(communicator
            .connection_factory()
            .failures()
            .has_failed_endpoint(&Endpoint::tcp("nowhere", 10000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_cached_endpoints_trigger_fresh_resolution() {
        let locator = StaticLocator::new(vec![vec![Endpoint::tcp("h2", 10000)]]);
        let transport = MockTransport::new().refuse("h1", 0);
        let communicator = Communicator::builder()
            .transport(transport.clone())
            .locator(locator.clone())
            .build();

        let info = communicator.locator_info().unwrap();
        info.cache().locations.put(
            LocationKey::new(vec!["printers".to_string()], Protocol::Ice2),
            vec![Endpoint::tcp("h1", 10000)],
        );
        // paused clock: the entry is used at age zero and still counts as cached
        let proxy = communicator.proxy(Reference::indirect("printer", "printers"));
        let reply = proxy.call("print", Value::Null).await.unwrap();
        assert_eq!(reply["host"], "h2");
        assert_eq!(locator.calls(), 1);
        assert_eq!(transport.connect_hosts(), vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn test_missing_object_retried_once_with_fresh_locator_data() {
        let locator = StaticLocator::new(vec![
            vec![Endpoint::tcp("h1", 10000)],
            vec![Endpoint::tcp("h2", 10000)],
        ]);
        let transport = MockTransport::new();
        transport.script(Script::Reply(ReplyStatus::ObjectNotExist, None));
        let communicator = Communicator::builder()
            .transport(transport.clone())
            .locator(locator.clone())
            .build();
        let proxy = communicator.proxy(Reference::indirect("printer", "printers"));

        let reply = proxy.call("print", Value::Null).await.unwrap();
        assert_eq!(reply["host"], "h2");
        assert_eq!(locator.calls(), 2);
        assert_eq!(transport.sent_to(), vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn test_missing_object_not_retried_twice() {
        let locator = StaticLocator::new(vec![vec![Endpoint::tcp("h1", 10000)]]);
        let transport = MockTransport::new();
        transport.script_n(Script::Reply(ReplyStatus::ObjectNotExist, None), 2);
        let communicator = Communicator::builder()
            .transport(transport.clone())
            .locator(locator.clone())
            .build();
        let proxy = communicator.proxy(Reference::indirect("printer", "printers"));

        let response = proxy
            .invoke(proxy.request("print", Value::Null), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, ReplyStatus::ObjectNotExist);
        assert_eq!(transport.sends(), 2);
        assert_eq!(locator.calls(), 2);
    }

    #[tokio::test]
    async fn test_indirect_reference_without_locator() {
        let transport = MockTransport::new();
        let communicator = communicator(&transport, InvocationConfig::default());
        let proxy = communicator.proxy(Reference::well_known("printer"));

        let error = proxy.call("print", Value::Null).await.unwrap_err();
        assert!(matches!(error.root(), LodestarError::NoEndpoint(_)));
    }
}
