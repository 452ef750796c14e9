pub mod endpoint;
pub mod error;
pub mod frames;
pub mod reference;
pub mod retry_policy;

pub use endpoint::{Connector, Endpoint, Protocol, TransportKind};
pub use error::{InvocationFailure, LodestarError, Result};
pub use frames::{ReplyStatus, RequestFrame, RequestId, ResponseFrame};
pub use reference::{ConnectionKey, EncodingVersion, Identity, InvocationMode, Reference, Target};
pub use retry_policy::RetryPolicy;

#[cfg(test)]
mod tests;
