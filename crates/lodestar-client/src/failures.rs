use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lodestar_common::protocol::{Connector, Endpoint};
use tokio::time::Instant;

/// Recently failing endpoints and connectors.
///
/// The table only biases ordering: failing items sort after healthy ones,
/// oldest failure first, and are never removed from a candidate list. Entries
/// older than the ttl are purged on every access.
pub struct TransportFailures {
    ttl: Duration,
    endpoints: Mutex<HashMap<Endpoint, Instant>>,
    connectors: Mutex<HashMap<Connector, Instant>>,
}

fn lock<K>(map: &Mutex<HashMap<K, Instant>>) -> MutexGuard<'_, HashMap<K, Instant>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

fn purge<K>(map: &mut HashMap<K, Instant>, ttl: Duration) {
    let now = Instant::now();
    map.retain(|_, failed_at| now.duration_since(*failed_at) < ttl);
}

/// Stable sort: healthy items keep their order at the front.
fn order<K: Eq + Hash + Clone>(items: &mut [K], map: &Mutex<HashMap<K, Instant>>, ttl: Duration) {
    let mut failures = lock(map);
    purge(&mut failures, ttl);
    if failures.is_empty() {
        return;
    }
    items.sort_by_key(|item| failures.get(item).copied());
}

impl TransportFailures {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            endpoints: Mutex::new(HashMap::new()),
            connectors: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure of `endpoint`, or of one of its connectors.
    pub fn record(&self, endpoint: &Endpoint, connector: Option<&Connector>) {
        let now = Instant::now();
        match connector {
            Some(connector) => {
                lock(&self.connectors).insert(connector.clone(), now);
            }
            None => {
                lock(&self.endpoints).insert(endpoint.clone(), now);
            }
        }
    }

    pub fn has_failed_endpoint(&self, endpoint: &Endpoint) -> bool {
        let mut failures = lock(&self.endpoints);
        purge(&mut failures, self.ttl);
        failures.contains_key(endpoint)
    }

    pub fn has_failed_connector(&self, connector: &Connector) -> bool {
        let mut failures = lock(&self.connectors);
        purge(&mut failures, self.ttl);
        failures.contains_key(connector)
    }

    pub fn order_endpoints(&self, endpoints: &mut [Endpoint]) {
        order(endpoints, &self.endpoints, self.ttl);
    }

    pub fn order_connectors(&self, connectors: &mut [Connector]) {
        order(connectors, &self.connectors, self.ttl);
    }

    pub fn len(&self) -> usize {
        lock(&self.endpoints).len() + lock(&self.connectors).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
