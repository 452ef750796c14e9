use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::Result;
use super::reference::Identity;
use super::retry_policy::RetryPolicy;

pub type RequestId = u64;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a unique request id.
///
/// The upper 48 bits hold the millisecond timestamp at the time of the call
/// and the lower 16 bits a process-wide counter.
fn next_request_id() -> RequestId {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    (millis << 16) | (counter & 0xFFFF)
}

/// An outgoing request.
///
/// The same frame is sent again on every retry, so its id is stable for the
/// whole invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    pub id: RequestId,
    pub identity: Identity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub facet: String,
    pub operation: String,
    #[serde(default)]
    pub idempotent: bool,
    /// Set by the invocation engine for requests that expect no reply.
    #[serde(default)]
    pub oneway: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    pub payload: Value,
}

impl RequestFrame {
    pub fn new(identity: impl Into<Identity>, operation: impl Into<String>, payload: Value) -> Self {
        Self {
            id: next_request_id(),
            identity: identity.into(),
            facet: String::new(),
            operation: operation.into(),
            idempotent: false,
            oneway: false,
            context: HashMap::new(),
            payload,
        }
    }

    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }

    /// Marks the operation as safe to execute more than once.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Encoded size of the request payload in bytes.
    pub fn payload_size(&self) -> Result<usize> {
        Ok(serde_json::to_vec(&self.payload)?.len())
    }
}

/// Outcome reported by the server for a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    UserException,
    ObjectNotExist,
    FacetNotExist,
    OperationNotExist,
    UnknownException,
}

impl ReplyStatus {
    /// The dispatch failed because the target did not exist on that server.
    pub fn is_not_exist(&self) -> bool {
        matches!(
            self,
            ReplyStatus::ObjectNotExist | ReplyStatus::FacetNotExist | ReplyStatus::OperationNotExist
        )
    }
}

/// A reply to a twoway request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFrame {
    pub id: RequestId,
    pub status: ReplyStatus,
    #[serde(default)]
    pub payload: Value,
    /// Server-provided retry hint for failure replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl ResponseFrame {
    pub fn success(id: RequestId, payload: Value) -> Self {
        Self {
            id,
            status: ReplyStatus::Ok,
            payload,
            retry_policy: None,
        }
    }

    pub fn failure(id: RequestId, status: ReplyStatus, payload: Value) -> Self {
        Self {
            id,
            status,
            payload,
            retry_policy: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}
