//! Tracing targets shared by every Lodestar crate.
//!
//! Filter them with `RUST_LOG`, e.g. `RUST_LOG=lodestar::retry=debug`.

/// Retry decisions of the invocation engine.
pub const RETRY: &str = "lodestar::retry";

/// Connection establishment and transport failures.
pub const TRANSPORT: &str = "lodestar::transport";

/// Locator lookups and cache maintenance.
pub const LOCATOR: &str = "lodestar::locator";
