//! Lodestar Metrics
//!
//! Observers for connection establishment and invocation progress.
//!
//! - [`Observer`] - event hooks called by the connection factory and the
//!   invocation engine
//! - [`NullObserver`] - the default, discarding everything
//! - [`MetricsObserver`] - aggregates counters and latency percentiles into a
//!   serializable [`MetricsSnapshot`]

mod collector;
mod histogram;
mod observer;
mod registry;
mod snapshot;

pub use collector::MetricsObserver;
pub use observer::{NullObserver, Observer};
pub use registry::{MetricsConfig, MetricsRegistry};
pub use snapshot::{EndpointMetrics, MetricsSnapshot, OperationMetrics};
