// Copyright 2025 Lodestar Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::Duration;

use lodestar_common::protocol::{Connector, Endpoint, LodestarError, ReplyStatus, RetryPolicy};
use tracing::trace;

use crate::observer::Observer;
use crate::registry::{MetricsConfig, MetricsRegistry};
use crate::snapshot::MetricsSnapshot;

/// Observer that aggregates events into a [`MetricsRegistry`].
///
/// # Example
///
/// ```rust
/// use lodestar_metrics::{MetricsObserver, Observer};
/// use std::time::Duration;
///
/// let metrics = MetricsObserver::new();
/// metrics.attempt("print", 1);
/// metrics.succeeded("print", Duration::from_millis(3));
/// assert_eq!(metrics.snapshot().total_successes, 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsObserver {
    registry: Arc<MetricsRegistry>,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            registry: Arc::new(MetricsRegistry::with_config(config)),
        }
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }

    /// Snapshot rendered as JSON.
    pub fn snapshot_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self.snapshot())
    }
}

impl Observer for MetricsObserver {
    fn connection_established(&self, endpoint: &Endpoint, _connector: &Connector) {
        self.registry.record_connection(&endpoint.to_string(), true);
    }

    fn connection_failed(&self, endpoint: &Endpoint, connector: &Connector, error: &LodestarError) {
        trace!(%endpoint, %connector, %error, "recording connection failure");
        self.registry.record_connection(&endpoint.to_string(), false);
    }

    fn attempt(&self, operation: &str, attempt: u32) {
        self.registry.record_attempt(operation, attempt);
    }

    fn remote_failure(&self, operation: &str, _status: ReplyStatus) {
        self.registry.record_remote_failure(operation);
    }

    fn retried(&self, operation: &str, _policy: RetryPolicy) {
        self.registry.record_retry(operation);
    }

    fn succeeded(&self, operation: &str, elapsed: Duration) {
        self.registry.record_success(operation, elapsed);
    }

    fn failed(&self, operation: &str, elapsed: Duration, _error: &LodestarError) {
        self.registry.record_failure(operation, elapsed);
    }
}
