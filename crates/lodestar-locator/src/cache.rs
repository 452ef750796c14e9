use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lodestar_common::protocol::{Endpoint, Identity, Protocol, Reference, Result};
use lodestar_common::single_flight::{Pending, SingleFlight};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cache key for a location path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationKey {
    pub location: Vec<String>,
    pub protocol: Protocol,
}

impl LocationKey {
    pub fn new(location: Vec<String>, protocol: Protocol) -> Self {
        Self { location, protocol }
    }
}

/// Cache key for a well-known object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WellKnownKey {
    pub identity: Identity,
    pub facet: String,
    pub protocol: Protocol,
}

impl WellKnownKey {
    pub fn of(reference: &Reference) -> Self {
        Self {
            identity: reference.identity().clone(),
            facet: reference.facet().to_string(),
            protocol: reference.protocol(),
        }
    }
}

/// What a well-known object resolved to.
///
/// Construction goes through [`WellKnownEntry::from_parts`], which keeps the
/// entry to exactly one non-empty alternative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WellKnownEntry {
    Endpoints(Vec<Endpoint>),
    /// Forwarding location that must be resolved in turn.
    Location(Vec<String>),
}

impl WellKnownEntry {
    /// Endpoints win over a location; `None` when both are empty.
    pub fn from_parts(endpoints: Vec<Endpoint>, location: Vec<String>) -> Option<Self> {
        if !endpoints.is_empty() {
            Some(WellKnownEntry::Endpoints(endpoints))
        } else if !location.is_empty() {
            Some(WellKnownEntry::Location(location))
        } else {
            None
        }
    }
}

struct Timestamped<V> {
    value: V,
    inserted: Instant,
}

/// A map of timestamped values plus the single-flight table of the lookups
/// that fill it.
///
/// Values are immutable once inserted; `put` replaces, `clear` removes.
pub struct CacheMap<K, V, F> {
    entries: Mutex<HashMap<K, Timestamped<V>>>,
    flights: Arc<SingleFlight<K, F>>,
}

impl<K, V, F> CacheMap<K, V, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone,
    F: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            flights: SingleFlight::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Timestamped<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached value and its age.
    pub fn get(&self, key: &K) -> Option<(V, Duration)> {
        self.lock()
            .get(key)
            .map(|entry| (entry.value.clone(), entry.inserted.elapsed()))
    }

    pub fn put(&self, key: K, value: V) {
        self.lock().insert(
            key,
            Timestamped {
                value,
                inserted: Instant::now(),
            },
        );
    }

    /// Removes the entry, returning what it held.
    pub fn clear(&self, key: &K) -> Option<V> {
        self.lock().remove(key).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Joins or starts the lookup for `key` and waits for it.
    pub async fn resolve_single_flight<R, Fut>(
        &self,
        key: K,
        resolver: R,
        cancel: &CancellationToken,
    ) -> Result<F>
    where
        R: FnOnce() -> Fut,
        Fut: Future<Output = Result<F>> + Send + 'static,
    {
        self.flights.run(key, resolver, cancel).await
    }

    /// Joins or starts the lookup for `key` without waiting.
    pub fn start_single_flight<R, Fut>(&self, key: K, resolver: R) -> Pending<F>
    where
        R: FnOnce() -> Fut,
        Fut: Future<Output = Result<F>> + Send + 'static,
    {
        self.flights.start(key, resolver)
    }

    pub fn is_resolving(&self, key: &K) -> bool {
        self.flights.is_pending(key)
    }
}

impl<K, V, F> Default for CacheMap<K, V, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone,
    F: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Resolved locations and well-known objects.
#[derive(Default)]
pub struct LocationCache {
    pub locations: CacheMap<LocationKey, Vec<Endpoint>, Vec<Endpoint>>,
    pub well_known: CacheMap<WellKnownKey, WellKnownEntry, Option<WellKnownEntry>>,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(name: &str) -> LocationKey {
        LocationKey::new(vec![name.to_string()], Protocol::Ice2)
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_grows_until_next_put() {
        let cache = LocationCache::new();
        cache.locations.put(key("A"), vec![Endpoint::tcp("h1", 1)]);
        let (_, first) = cache.locations.get(&key("A")).unwrap();
        assert_eq!(first, Duration::ZERO);

        tokio::time::advance(Duration::from_secs(3)).await;
        let (_, second) = cache.locations.get(&key("A")).unwrap();
        assert_eq!(second, Duration::from_secs(3));

        tokio::time::advance(Duration::from_millis(1)).await;
        let (_, third) = cache.locations.get(&key("A")).unwrap();
        assert!(third >= second);

        cache.locations.put(key("A"), vec![Endpoint::tcp("h2", 1)]);
        let (endpoints, reset) = cache.locations.get(&key("A")).unwrap();
        assert_eq!(reset, Duration::ZERO);
        assert_eq!(endpoints[0].host, "h2");
    }

    #[test]
    fn test_clear_removes_entry() {
        let cache = LocationCache::new();
        cache.locations.put(key("A"), vec![Endpoint::tcp("h1", 1)]);
        assert!(cache.locations.clear(&key("A")).is_some());
        assert!(cache.locations.get(&key("A")).is_none());
        assert!(cache.locations.clear(&key("A")).is_none());
    }

    #[test]
    fn test_well_known_entry_parts() {
        let endpoints = vec![Endpoint::tcp("h1", 1)];
        assert_eq!(
            WellKnownEntry::from_parts(endpoints.clone(), vec!["A".into()]),
            Some(WellKnownEntry::Endpoints(endpoints))
        );
        assert_eq!(
            WellKnownEntry::from_parts(Vec::new(), vec!["A".into()]),
            Some(WellKnownEntry::Location(vec!["A".into()]))
        );
        assert_eq!(WellKnownEntry::from_parts(Vec::new(), Vec::new()), None);
    }

    #[tokio::test]
    async fn test_single_flight_shares_resolver() {
        let cache = Arc::new(LocationCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let lookups = (0..8).map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            let token = token.clone();
            async move {
                cache
                    .locations
                    .resolve_single_flight(
                        key("A"),
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(vec![Endpoint::tcp("h1", 1)])
                        },
                        &token,
                    )
                    .await
            }
        });
        let results = futures::future::join_all(lookups).await;
        assert!(results.iter().all(|r| r.as_ref().unwrap().len() == 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.locations.is_resolving(&key("A")));
    }
}
