//! Lodestar Common Types and Transport
//!
//! Shared building blocks of the Lodestar RPC core:
//!
//! - [`protocol`] - references, endpoints, frames, retry policies and errors
//! - [`transport`] - the transport traits plus a TCP implementation
//! - [`config`] - invocation and locator cache settings
//! - [`single_flight`] - coalescing of concurrent identical requests
//! - [`trace`] - tracing targets used across the workspace
//!
//! # Example
//!
//! ```
//! use lodestar_common::{Endpoint, Reference, RequestFrame};
//! use serde_json::json;
//!
//! let reference = Reference::direct("printer", vec![Endpoint::tcp("10.0.0.1", 10000)]);
//! let request = RequestFrame::new(reference.identity().clone(), "print", json!({"doc": "a.txt"}))
//!     .idempotent();
//! assert!(request.idempotent);
//! ```

pub mod cancel;
pub mod config;
pub mod protocol;
pub mod single_flight;
pub mod trace;
pub mod transport;

pub use config::InvocationConfig;
pub use protocol::*;
