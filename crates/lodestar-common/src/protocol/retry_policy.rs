use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Decision on whether and how an invocation may be attempted again.
///
/// Servers can attach a policy to a failure reply as a hint; the client side
/// produces one for every failed attempt through the retry classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    #[default]
    NoRetry,
    Immediately,
    AfterDelay(Duration),
    OtherReplica,
}

impl RetryPolicy {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RetryPolicy::NoRetry)
    }

    /// Delay to wait before the next attempt.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryPolicy::AfterDelay(delay) if !delay.is_zero() => Some(*delay),
            _ => None,
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::NoRetry => write!(f, "no retry"),
            RetryPolicy::Immediately => write!(f, "retry immediately"),
            RetryPolicy::AfterDelay(delay) => write!(f, "retry after {:?}", delay),
            RetryPolicy::OtherReplica => write!(f, "retry other replica"),
        }
    }
}
