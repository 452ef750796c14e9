use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lodestar_common::protocol::{Endpoint, LodestarError, Protocol, Reference, Result};
use lodestar_common::{trace, InvocationConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{LocationCache, LocationKey, WellKnownEntry, WellKnownKey};
use crate::locator::Locator;

/// Endpoints of an indirect reference, as returned by [`LocatorInfo::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub endpoints: Vec<Endpoint>,
    /// Age of the cache entry used, zero when just resolved. For well-known
    /// references this is the age of the well-known entry.
    pub age: Duration,
    /// Part of the answer came from the cache rather than the locator.
    pub cached: bool,
}

/// Resolves indirect references through a locator, backed by a [`LocationCache`].
///
/// Lookups run on detached tasks shared by every caller asking for the same
/// key. A caller that is cancelled stops waiting; the lookup itself completes
/// and fills the cache for the next caller.
///
/// # Example
///
/// ```no_run
/// use lodestar_common::{InvocationConfig, Reference};
/// use lodestar_locator::{Locator, LocatorInfo};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(locator: Arc<dyn Locator>) -> lodestar_common::Result<()> {
/// let info = LocatorInfo::new(locator, &InvocationConfig::default());
/// let printer = Reference::well_known("printer1");
/// let resolution = info.resolve(&printer, None, &CancellationToken::new()).await?;
/// println!("{} endpoints, cached: {}", resolution.endpoints.len(), resolution.cached);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocatorInfo {
    inner: Arc<Inner>,
}

struct Inner {
    locator: Arc<dyn Locator>,
    cache: LocationCache,
    background: bool,
    default_timeout: Option<Duration>,
    /// Set once the locator has shown it lacks the `resolve_*` calls.
    legacy: AtomicBool,
}

impl LocatorInfo {
    pub fn new(locator: Arc<dyn Locator>, config: &InvocationConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                locator,
                cache: LocationCache::new(),
                background: config.background_locator_cache_updates,
                default_timeout: config.default_locator_cache_timeout,
                legacy: AtomicBool::new(false),
            }),
        }
    }

    pub fn locator(&self) -> &Arc<dyn Locator> {
        &self.inner.locator
    }

    pub fn cache(&self) -> &LocationCache {
        &self.inner.cache
    }

    /// Effective cache timeout for `reference`; `None` never expires.
    pub fn cache_timeout(&self, reference: &Reference) -> Option<Duration> {
        reference
            .locator_cache_timeout()
            .unwrap_or(self.inner.default_timeout)
    }

    /// Resolves an indirect reference into endpoints.
    ///
    /// # Arguments
    ///
    /// * `reference` - A well-known or location-based reference
    /// * `max_age` - A cache entry whose age is greater than or equal to
    ///   `max_age` is too old and is resolved again, so `Some(Duration::ZERO)`
    ///   always asks the locator; `None` accepts any age
    /// * `cancel` - Abandons the wait, not the locator lookup
    ///
    /// # Returns
    ///
    /// A [`Resolution`] telling whether the cache was used. An empty endpoint
    /// list means the locator knows no endpoints; nothing empty is ever cached.
    pub async fn resolve(
        &self,
        reference: &Reference,
        max_age: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Resolution> {
        if !reference.is_indirect() {
            return Err(LodestarError::InvalidReference(format!(
                "{} carries no location to resolve",
                reference
            )));
        }

        let timeout = self.cache_timeout(reference);
        let use_cache = timeout != Some(Duration::ZERO);
        let expired = |age: Duration| timeout.is_some_and(|t| age > t);
        let too_old = |age: Duration| max_age.is_some_and(|max| age >= max);
        let background = self.inner.background;

        let mut location = reference.location().to_vec();
        let mut well_known_age = Duration::ZERO;
        let mut well_known_cached = false;

        if reference.is_well_known() {
            let key = WellKnownKey::of(reference);
            let cached = if use_cache {
                self.inner.cache.well_known.get(&key)
            } else {
                None
            };

            let entry = match cached {
                Some((entry, age)) if !too_old(age) && (background || !expired(age)) => {
                    if expired(age) {
                        debug!(target: trace::LOCATOR, %reference, ?age, "serving expired well-known entry, refreshing in background");
                        self.refresh_well_known(key);
                    }
                    well_known_age = age;
                    well_known_cached = true;
                    Some(entry)
                }
                _ => self.resolve_well_known(key, cancel).await?,
            };

            match entry {
                None => {
                    info!(target: trace::LOCATOR, %reference, "could not find endpoints for well-known proxy");
                    return Ok(Resolution {
                        endpoints: Vec::new(),
                        age: Duration::ZERO,
                        cached: false,
                    });
                }
                Some(WellKnownEntry::Endpoints(endpoints)) => {
                    if !well_known_cached {
                        info!(target: trace::LOCATOR, %reference, endpoints = ?endpoints, "resolved well-known proxy");
                    } else {
                        debug!(target: trace::LOCATOR, %reference, "found well-known proxy in locator cache");
                    }
                    return Ok(Resolution {
                        endpoints,
                        age: well_known_age,
                        cached: well_known_cached,
                    });
                }
                Some(WellKnownEntry::Location(forward)) => location = forward,
            }
        }

        let key = LocationKey::new(location, reference.protocol());
        let cached = if use_cache {
            self.inner.cache.locations.get(&key)
        } else {
            None
        };

        let (endpoints, age, location_cached) = match cached {
            Some((endpoints, age))
                if !too_old(age)
                    && (background || !expired(age))
                    && !(reference.is_well_known() && well_known_age <= age) =>
            {
                if expired(age) {
                    debug!(target: trace::LOCATOR, location = ?key.location, ?age, "serving expired location entry, refreshing in background");
                    self.refresh_location(key.clone());
                }
                debug!(target: trace::LOCATOR, location = ?key.location, "found location in locator cache");
                (endpoints, age, true)
            }
            _ => {
                let resolved = self.resolve_location(key.clone(), cancel).await;
                let unresolved = resolved.as_ref().map_or(true, |endpoints| endpoints.is_empty());
                if unresolved && reference.is_well_known() {
                    self.clear_cache(reference);
                }
                (resolved?, Duration::ZERO, false)
            }
        };

        if endpoints.is_empty() {
            info!(target: trace::LOCATOR, location = ?key.location, "could not find endpoints for location");
        }
        let age = if reference.is_well_known() {
            well_known_age
        } else {
            age
        };
        Ok(Resolution {
            endpoints,
            age,
            cached: well_known_cached || location_cached,
        })
    }

    /// Drops what the cache knows about `reference`.
    ///
    /// For a well-known reference that was forwarded to a location, the
    /// location entry goes too.
    pub fn clear_cache(&self, reference: &Reference) {
        if reference.is_well_known() {
            self.inner.clear_well_known(&WellKnownKey::of(reference));
        } else if !reference.location().is_empty() {
            self.inner.clear_location(&LocationKey::new(
                reference.location().to_vec(),
                reference.protocol(),
            ));
        }
    }

    async fn resolve_well_known(
        &self,
        key: WellKnownKey,
        cancel: &CancellationToken,
    ) -> Result<Option<WellKnownEntry>> {
        info!(target: trace::LOCATOR, identity = %key.identity, facet = %key.facet, "resolving well-known proxy");
        let inner = self.inner.clone();
        let flight_key = key.clone();
        self.inner
            .cache
            .well_known
            .resolve_single_flight(flight_key, move || inner.perform_resolve_well_known(key), cancel)
            .await
    }

    fn refresh_well_known(&self, key: WellKnownKey) {
        let inner = self.inner.clone();
        let flight_key = key.clone();
        // detached: the lookup task outlives this handle
        let _ = self
            .inner
            .cache
            .well_known
            .start_single_flight(flight_key, move || inner.perform_resolve_well_known(key));
    }

    async fn resolve_location(
        &self,
        key: LocationKey,
        cancel: &CancellationToken,
    ) -> Result<Vec<Endpoint>> {
        info!(target: trace::LOCATOR, location = ?key.location, "resolving location");
        let inner = self.inner.clone();
        let flight_key = key.clone();
        self.inner
            .cache
            .locations
            .resolve_single_flight(flight_key, move || inner.perform_resolve_location(key), cancel)
            .await
    }

    fn refresh_location(&self, key: LocationKey) {
        let inner = self.inner.clone();
        let flight_key = key.clone();
        let _ = self
            .inner
            .cache
            .locations
            .start_single_flight(flight_key, move || inner.perform_resolve_location(key));
    }
}

impl Inner {
    fn uses_find_calls(&self, protocol: Protocol) -> bool {
        protocol == Protocol::Ice1 || self.legacy.load(Ordering::Relaxed)
    }

    fn mark_legacy(&self, error: &LodestarError) -> bool {
        if matches!(error.root(), LodestarError::OperationNotExist(_)) {
            if !self.legacy.swap(true, Ordering::Relaxed) {
                warn!(target: trace::LOCATOR, "locator lacks resolve operations, falling back to find_adapter_by_id/find_object_by_id");
            }
            true
        } else {
            false
        }
    }

    fn clear_location(&self, key: &LocationKey) {
        if let Some(endpoints) = self.cache.locations.clear(key) {
            info!(target: trace::LOCATOR, location = ?key.location, endpoints = ?endpoints, "cleared location endpoints from locator cache");
        }
    }

    fn clear_well_known(&self, key: &WellKnownKey) {
        match self.cache.well_known.clear(key) {
            Some(WellKnownEntry::Endpoints(endpoints)) => {
                info!(target: trace::LOCATOR, identity = %key.identity, endpoints = ?endpoints, "cleared well-known proxy endpoints from locator cache");
            }
            Some(WellKnownEntry::Location(location)) => {
                info!(target: trace::LOCATOR, identity = %key.identity, location = ?location, "cleared well-known proxy without endpoints from locator cache");
                self.clear_location(&LocationKey::new(location, key.protocol));
            }
            None => {}
        }
    }

    async fn perform_resolve_location(self: Arc<Self>, key: LocationKey) -> Result<Vec<Endpoint>> {
        let endpoints = match self.lookup_location(&key).await {
            Ok(endpoints) => endpoints,
            Err(error) => {
                warn!(target: trace::LOCATOR, location = ?key.location, %error, "failed to resolve location");
                return Err(LodestarError::Locator(Arc::new(error)));
            }
        };

        if endpoints.is_empty() {
            self.clear_location(&key);
        } else {
            info!(target: trace::LOCATOR, location = ?key.location, endpoints = ?endpoints, "resolved location");
            self.cache.locations.put(key, endpoints.clone());
        }
        Ok(endpoints)
    }

    async fn lookup_location(&self, key: &LocationKey) -> Result<Vec<Endpoint>> {
        if !self.uses_find_calls(key.protocol) {
            match self.locator.resolve_location(&key.location).await {
                Ok(endpoints) => return Ok(endpoints),
                Err(error) if self.mark_legacy(&error) => {}
                Err(error) => return Err(error),
            }
        }

        let Some(adapter_id) = key.location.first() else {
            return Ok(Vec::new());
        };
        let resolved = match self.locator.find_adapter_by_id(adapter_id).await {
            Ok(resolved) => resolved,
            Err(error) if matches!(error.root(), LodestarError::AdapterNotFound(_)) => None,
            Err(error) => return Err(error),
        };

        match resolved {
            Some(resolved)
                if resolved.endpoints().is_empty() || resolved.protocol() != key.protocol =>
            {
                warn!(target: trace::LOCATOR, location = ?key.location, %resolved, "locator returned an invalid reference for location");
                Ok(Vec::new())
            }
            Some(resolved) => Ok(resolved.endpoints().to_vec()),
            None => Ok(Vec::new()),
        }
    }

    async fn perform_resolve_well_known(
        self: Arc<Self>,
        key: WellKnownKey,
    ) -> Result<Option<WellKnownEntry>> {
        let entry = match self.lookup_well_known(&key).await {
            Ok(entry) => entry,
            Err(error) => {
                warn!(target: trace::LOCATOR, identity = %key.identity, %error, "failed to resolve well-known proxy");
                return Err(LodestarError::Locator(Arc::new(error)));
            }
        };

        match &entry {
            Some(entry) => self.cache.well_known.put(key, entry.clone()),
            None => self.clear_well_known(&key),
        }
        Ok(entry)
    }

    async fn lookup_well_known(&self, key: &WellKnownKey) -> Result<Option<WellKnownEntry>> {
        if !self.uses_find_calls(key.protocol) {
            match self
                .locator
                .resolve_well_known_proxy(&key.identity, &key.facet)
                .await
            {
                Ok((endpoints, location)) => return Ok(WellKnownEntry::from_parts(endpoints, location)),
                Err(error) if self.mark_legacy(&error) => {}
                Err(error) => return Err(error),
            }
        }

        let resolved = match self.locator.find_object_by_id(&key.identity, &key.facet).await {
            Ok(resolved) => resolved,
            Err(error) if matches!(error.root(), LodestarError::ObjectNotFound(_)) => None,
            Err(error) => return Err(error),
        };

        match resolved {
            Some(resolved)
                if resolved.is_well_known()
                    || resolved.is_fixed()
                    || resolved.protocol() != key.protocol =>
            {
                warn!(target: trace::LOCATOR, identity = %key.identity, %resolved, "locator returned an invalid reference for well-known proxy");
                Ok(None)
            }
            Some(resolved) => Ok(WellKnownEntry::from_parts(
                resolved.endpoints().to_vec(),
                resolved.location().to_vec(),
            )),
            None => Ok(None),
        }
    }
}
