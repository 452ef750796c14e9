use std::time::Duration;

use lodestar_common::protocol::{Connector, Endpoint, LodestarError, ReplyStatus, RetryPolicy};

/// Receives events from the connection factory and the invocation engine.
///
/// Every method has an empty default body, so implementors pick only the
/// events they care about. Methods are called inline on the invoking task and
/// must not block.
pub trait Observer: Send + Sync {
    fn connection_established(&self, _endpoint: &Endpoint, _connector: &Connector) {}

    fn connection_failed(&self, _endpoint: &Endpoint, _connector: &Connector, _error: &LodestarError) {}

    /// An invocation is about to make attempt number `attempt` (1-based).
    fn attempt(&self, _operation: &str, _attempt: u32) {}

    /// The server answered with a failure reply.
    fn remote_failure(&self, _operation: &str, _status: ReplyStatus) {}

    /// The engine decided to try again.
    fn retried(&self, _operation: &str, _policy: RetryPolicy) {}

    fn succeeded(&self, _operation: &str, _elapsed: Duration) {}

    fn failed(&self, _operation: &str, _elapsed: Duration, _error: &LodestarError) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {}
