use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::endpoint::{Connector, Endpoint};
use super::frames::ReplyStatus;
use super::retry_policy::RetryPolicy;

/// Errors produced by the resolver, the connection factory and the invocation engine.
#[derive(Error, Debug)]
pub enum LodestarError {
    #[error("Resolution of {host} failed: {reason}")]
    Resolution { host: String, reason: String },

    #[error("Connection to {0} refused")]
    ConnectFailed(String),

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connection closed (by peer: {by_peer})")]
    ConnectionClosed { by_peer: bool },

    #[error("Fixed connection is no longer available")]
    ConnectionGone,

    #[error("Invocation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No endpoint available for {0}")]
    NoEndpoint(String),

    #[error("Adapter {0} not found")]
    AdapterNotFound(String),

    #[error("Object {0} not found")]
    ObjectNotFound(String),

    #[error("Operation {0} does not exist")]
    OperationNotExist(String),

    #[error("Remote failure ({status:?}): {payload}")]
    RemoteFailure {
        status: ReplyStatus,
        payload: serde_json::Value,
    },

    #[error("Locator request failed: {0}")]
    Locator(Arc<LodestarError>),

    #[error(transparent)]
    Shared(Arc<LodestarError>),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Feature not supported: {0}")]
    FeatureNotSupported(String),

    #[error("Communicator has been shut down")]
    Disposed,

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Invocation(Box<InvocationFailure>),
}

impl LodestarError {
    /// Unwraps shared and locator wrappers down to the error that actually occurred.
    pub fn root(&self) -> &LodestarError {
        match self {
            LodestarError::Shared(inner) | LodestarError::Locator(inner) => inner.root(),
            LodestarError::Invocation(failure) => failure.error.root(),
            other => other,
        }
    }

    /// True for failures raised while establishing a connection.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self.root(),
            LodestarError::ConnectFailed(_)
                | LodestarError::ConnectTimeout(_)
                | LodestarError::Resolution { .. }
        )
    }

    /// True for failures of an established connection.
    pub fn is_transport_failure(&self) -> bool {
        self.is_connect_failure()
            || matches!(
                self.root(),
                LodestarError::ConnectionLost(_)
                    | LodestarError::ConnectionClosed { .. }
                    | LodestarError::Io(_)
            )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), LodestarError::Cancelled)
    }

    /// Wraps an error shared between several waiters.
    pub fn shared(error: Arc<LodestarError>) -> Self {
        LodestarError::Shared(error)
    }
}

/// Terminal failure of an invocation after the retry loop gave up.
#[derive(Debug)]
pub struct InvocationFailure {
    pub operation: String,
    pub error: LodestarError,
    pub attempts: u32,
    pub endpoint: Option<Endpoint>,
    pub connector: Option<Connector>,
    pub last_policy: RetryPolicy,
}

impl fmt::Display for InvocationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invocation of {} failed after {} attempt(s): {}",
            self.operation, self.attempts, self.error
        )?;
        if let Some(endpoint) = &self.endpoint {
            write!(f, " (endpoint {}", endpoint)?;
            if let Some(connector) = &self.connector {
                write!(f, ", connector {}", connector)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, LodestarError>;
