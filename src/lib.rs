//! Lodestar
//!
//! Location-transparent RPC invocations: references resolved through a
//! locator cache, connections established with failure-aware ordering, and
//! invocations retried according to a retry policy.
//!
//! This crate re-exports the workspace members:
//!
//! - [`common`] - references, endpoints, frames, errors and the TCP transport
//! - [`locator`] - locator trait, location cache and resolver
//! - [`client`] - communicator, proxies, connection factory and retry classifier
//! - [`metrics`] - invocation observers

pub use lodestar_client as client;
pub use lodestar_common as common;
pub use lodestar_locator as locator;
pub use lodestar_metrics as metrics;

pub use lodestar_client::{Communicator, Interceptor, Next, Proxy};
pub use lodestar_common::{
    Endpoint, Identity, InvocationConfig, InvocationMode, LodestarError, Reference, RequestFrame, ResponseFrame,
    Result, RetryPolicy,
};
pub use lodestar_locator::Locator;
pub use lodestar_metrics::{MetricsObserver, Observer};
