//! Lodestar Client
//!
//! The invocation side of Lodestar: a [`Communicator`] hands out [`Proxy`]
//! handles that turn references into connections and requests into replies.
//!
//! # Architecture
//!
//! ```text
//! Proxy::invoke
//!   -> interceptors (once per invocation)
//!   -> attempt loop
//!        -> LocatorInfo (indirect references)
//!        -> ConnectionFactory (endpoints -> connectors -> connection)
//!        -> Exchange (send, receive)
//!        -> RetryClassifier (failed attempts)
//! ```
//!
//! Attempts of one invocation are strictly sequential. Endpoints are tried
//! round-robin across attempts, connectors in order with recently failing ones
//! last. A request that was sent is only resent when it is idempotent or the
//! peer closed the connection gracefully.

pub mod communicator;
pub mod connection;
pub mod factory;
pub mod failures;
pub mod interceptor;
pub mod proxy;
pub mod retry;

pub use communicator::{Communicator, CommunicatorBuilder};
pub use connection::{Connection, ConnectionRegistry, Exchange};
pub use factory::ConnectionFactory;
pub use failures::TransportFailures;
pub use interceptor::{Interceptor, Next};
pub use proxy::Proxy;
pub use retry::{AttemptOutcome, BufferLimit, RetryBuffer, RetryClassifier, RetryReservation};

#[cfg(test)]
mod tests;
