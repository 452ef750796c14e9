//! Lodestar Locator
//!
//! Resolution of indirect references. A reference may name an adapter (a
//! location) or only an identity (a well-known object); the [`LocatorInfo`]
//! turns either into endpoints by asking a [`Locator`] service and
//! remembering the answers in a [`LocationCache`].
//!
//! # Caching rules
//!
//! - Entries older than the reference's locator cache timeout are expired.
//!   Expired entries are re-resolved before use, or served as-is while a
//!   detached refresh runs when background updates are enabled.
//! - Concurrent lookups of one key share a single locator call.
//! - Empty answers are never cached; they evict whatever was cached.
//! - A well-known entry forwarding to a location forces the location to be
//!   re-resolved unless the location entry is strictly fresher.

pub mod cache;
pub mod info;
pub mod locator;

pub use cache::{CacheMap, LocationCache, LocationKey, WellKnownEntry, WellKnownKey};
pub use info::{LocatorInfo, Resolution};
pub use locator::Locator;
