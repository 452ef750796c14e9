//! Retry decisions and retry-buffer accounting.
//!
//! [`RetryClassifier::classify`] is a pure function of an [`AttemptOutcome`]
//! and the retry number. Attempt budgets and locator cache handling belong to
//! the invocation engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lodestar_common::protocol::{LodestarError, ResponseFrame, RetryPolicy};

/// What happened to one physical attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Name lookup for an endpoint failed.
    ResolutionFailed,
    /// Connect refused or timed out; nothing was sent.
    ConnectFailed,
    ConnectionLostBeforeSend,
    ConnectionLostAfterSend { idempotent: bool, closed_by_peer: bool },
    /// The attempt ran past the invocation timeout.
    TimedOut { sent: bool, idempotent: bool },
    /// The peer answered with a failure and advised a policy.
    RemoteFailureWithHint(RetryPolicy),
    RemoteFailureNoHint,
    ProtocolError,
    Cancelled,
}

impl AttemptOutcome {
    /// Maps a local error raised during an attempt.
    ///
    /// `sent` tells whether the request frame was fully written before the
    /// error occurred.
    pub fn from_error(error: &LodestarError, sent: bool, idempotent: bool) -> Self {
        match error.root() {
            LodestarError::Cancelled => AttemptOutcome::Cancelled,
            LodestarError::Resolution { .. } => AttemptOutcome::ResolutionFailed,
            LodestarError::ConnectFailed(_) | LodestarError::ConnectTimeout(_) => AttemptOutcome::ConnectFailed,
            LodestarError::Timeout(_) => AttemptOutcome::TimedOut { sent, idempotent },
            LodestarError::ConnectionClosed { by_peer } if sent => AttemptOutcome::ConnectionLostAfterSend {
                idempotent,
                closed_by_peer: *by_peer,
            },
            LodestarError::ConnectionLost(_) | LodestarError::Io(_) if sent => {
                AttemptOutcome::ConnectionLostAfterSend {
                    idempotent,
                    closed_by_peer: false,
                }
            }
            LodestarError::ConnectionClosed { .. }
            | LodestarError::ConnectionLost(_)
            | LodestarError::Io(_) => AttemptOutcome::ConnectionLostBeforeSend,
            _ => AttemptOutcome::ProtocolError,
        }
    }

    /// Maps a failure reply from the peer.
    pub fn from_response(response: &ResponseFrame) -> Self {
        match response.retry_policy {
            Some(policy) => AttemptOutcome::RemoteFailureWithHint(policy),
            None => AttemptOutcome::RemoteFailureNoHint,
        }
    }
}

/// Maps attempt outcomes to retry policies using the configured interval schedule.
#[derive(Debug, Clone)]
pub struct RetryClassifier {
    intervals: Vec<i64>,
}

impl RetryClassifier {
    /// `intervals` are milliseconds per retry; `-1` stops retrying.
    pub fn new(intervals: &[i64]) -> Self {
        Self {
            intervals: intervals.to_vec(),
        }
    }

    /// Decides whether retry number `retry` (1 for the first retry) may follow `outcome`.
    pub fn classify(&self, outcome: &AttemptOutcome, retry: u32) -> RetryPolicy {
        match *outcome {
            AttemptOutcome::RemoteFailureWithHint(policy) => policy,
            AttemptOutcome::RemoteFailureNoHint | AttemptOutcome::ProtocolError | AttemptOutcome::Cancelled => {
                RetryPolicy::NoRetry
            }
            AttemptOutcome::ConnectionLostAfterSend {
                idempotent: false,
                closed_by_peer: false,
            }
            | AttemptOutcome::TimedOut {
                sent: true,
                idempotent: false,
            } => RetryPolicy::NoRetry,
            AttemptOutcome::ResolutionFailed
            | AttemptOutcome::ConnectFailed
            | AttemptOutcome::ConnectionLostBeforeSend
            | AttemptOutcome::ConnectionLostAfterSend { .. }
            | AttemptOutcome::TimedOut { .. } => self.scheduled(retry),
        }
    }

    fn scheduled(&self, retry: u32) -> RetryPolicy {
        if self.intervals.first() == Some(&-1) {
            return RetryPolicy::NoRetry;
        }
        let Some(last) = self.intervals.len().checked_sub(1) else {
            return RetryPolicy::NoRetry;
        };
        let index = (retry.max(1) as usize - 1).min(last);
        match self.intervals[index] {
            0 => RetryPolicy::Immediately,
            ms if ms > 0 => RetryPolicy::AfterDelay(Duration::from_millis(ms as u64)),
            _ => RetryPolicy::NoRetry,
        }
    }
}

/// Process-wide budget for request payloads kept around for resending.
#[derive(Debug)]
pub struct RetryBuffer {
    max: usize,
    request_max: usize,
    used: AtomicUsize,
}

/// Why a request could not be kept for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLimit {
    RequestSizeMax,
    BufferSizeMax,
}

impl std::fmt::Display for BufferLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferLimit::RequestSizeMax => write!(f, "request size exceeds retry_request_size_max"),
            BufferLimit::BufferSizeMax => write!(f, "retry buffer would exceed retry_buffer_size_max"),
        }
    }
}

impl RetryBuffer {
    pub fn new(max: usize, request_max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            request_max,
            used: AtomicUsize::new(0),
        })
    }

    /// Reserves `size` bytes, released when the reservation drops.
    pub fn reserve(self: &Arc<Self>, size: usize) -> std::result::Result<RetryReservation, BufferLimit> {
        if size > self.request_max {
            return Err(BufferLimit::RequestSizeMax);
        }
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= self.max)
            })
            .map_err(|_| BufferLimit::BufferSizeMax)?;
        Ok(RetryReservation {
            buffer: self.clone(),
            size,
        })
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct RetryReservation {
    buffer: Arc<RetryBuffer>,
    size: usize,
}

impl Drop for RetryReservation {
    fn drop(&mut self) {
        self.buffer.used.fetch_sub(self.size, Ordering::AcqRel);
    }
}
