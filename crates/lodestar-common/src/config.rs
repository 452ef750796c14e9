use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Invocation and resolution settings shared by every proxy of a communicator.
///
/// # Default Configuration
///
/// - `retry_intervals`: `[0]` (one immediate retry slot, reused for later retries)
/// - `retry_max_attempts`: 5
/// - `retry_buffer_size_max`: 100 MiB
/// - `retry_request_size_max`: 1 MiB
/// - `invocation_timeout`: none
/// - `default_locator_cache_timeout`: none (entries never expire)
/// - `background_locator_cache_updates`: false
/// - `connect_timeout`: 10 seconds
/// - `transport_failure_ttl`: 10 seconds
///
/// # Example
///
/// ```rust
/// use lodestar_common::InvocationConfig;
/// use std::time::Duration;
///
/// let config = InvocationConfig::default()
///     .with_retry_intervals(vec![0, 100, 500])
///     .with_invocation_timeout(Duration::from_secs(2));
/// assert_eq!(config.retry_max_attempts, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationConfig {
    /// Delay in milliseconds before each retry; the last value repeats.
    /// A value of `-1` disables retries from that point on.
    pub retry_intervals: Vec<i64>,
    /// Upper bound on attempts per invocation, first attempt included.
    pub retry_max_attempts: u32,
    /// Total bytes of request payload kept for possible resend.
    pub retry_buffer_size_max: usize,
    /// Requests larger than this are never kept for resend.
    pub retry_request_size_max: usize,
    /// Timeout applied to each attempt separately.
    pub invocation_timeout: Option<Duration>,
    /// Maximum age of locator cache entries; `None` means they never expire.
    pub default_locator_cache_timeout: Option<Duration>,
    /// Serve expired entries and refresh them in the background.
    pub background_locator_cache_updates: bool,
    pub connect_timeout: Duration,
    /// How long a transport failure demotes an endpoint or connector.
    pub transport_failure_ttl: Duration,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            retry_intervals: vec![0],
            retry_max_attempts: 5,
            retry_buffer_size_max: 100 * 1024 * 1024,
            retry_request_size_max: 1024 * 1024,
            invocation_timeout: None,
            default_locator_cache_timeout: None,
            background_locator_cache_updates: false,
            connect_timeout: Duration::from_secs(10),
            transport_failure_ttl: Duration::from_secs(10),
        }
    }
}

impl InvocationConfig {
    pub fn with_retry_intervals(mut self, intervals: Vec<i64>) -> Self {
        self.retry_intervals = intervals;
        self
    }

    pub fn with_retry_max_attempts(mut self, attempts: u32) -> Self {
        self.retry_max_attempts = attempts;
        self
    }

    pub fn with_retry_buffer_size_max(mut self, bytes: usize) -> Self {
        self.retry_buffer_size_max = bytes;
        self
    }

    pub fn with_retry_request_size_max(mut self, bytes: usize) -> Self {
        self.retry_request_size_max = bytes;
        self
    }

    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = Some(timeout);
        self
    }

    pub fn with_locator_cache_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_locator_cache_timeout = timeout;
        self
    }

    pub fn with_background_locator_cache_updates(mut self, enabled: bool) -> Self {
        self.background_locator_cache_updates = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_transport_failure_ttl(mut self, ttl: Duration) -> Self {
        self.transport_failure_ttl = ttl;
        self
    }
}
