use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::histogram::LatencyHistogram;
use crate::snapshot::{EndpointMetrics, MetricsSnapshot, OperationMetrics};

/// Limits on how many distinct keys the registry tracks.
///
/// Events for keys beyond the limit still count toward the totals.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub max_operations: usize,
    pub max_endpoints: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_operations: 1000,
            max_endpoints: 1000,
        }
    }
}

#[derive(Debug)]
struct OperationStats {
    invocations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    remote_failures: AtomicU64,
    latencies: LatencyHistogram,
}

impl OperationStats {
    fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            remote_failures: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
        }
    }

    fn snapshot(&self) -> OperationMetrics {
        let (avg, p50, p95, p99) = self.latencies.summary();
        OperationMetrics {
            invocations: self.invocations.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            avg_latency_us: avg,
            p50_latency_us: p50,
            p95_latency_us: p95,
            p99_latency_us: p99,
        }
    }
}

#[derive(Debug, Default)]
struct EndpointStats {
    established: AtomicU64,
    failed: AtomicU64,
}

/// Thread-safe store of invocation and connection counters.
///
/// Counters are atomics updated with relaxed ordering; the maps are only
/// write-locked the first time a key is seen.
#[derive(Debug)]
pub struct MetricsRegistry {
    config: MetricsConfig,
    started: Instant,
    total_invocations: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_retries: AtomicU64,
    operations: RwLock<HashMap<String, Arc<OperationStats>>>,
    endpoints: RwLock<HashMap<String, Arc<EndpointStats>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            total_invocations: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            operations: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    fn operation(&self, name: &str) -> Option<Arc<OperationStats>> {
        if let Some(stats) = self
            .operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Some(stats.clone());
        }
        let mut operations = self.operations.write().unwrap_or_else(PoisonError::into_inner);
        if !operations.contains_key(name) && operations.len() >= self.config.max_operations {
            return None;
        }
        Some(
            operations
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OperationStats::new()))
                .clone(),
        )
    }

    fn endpoint(&self, name: &str) -> Option<Arc<EndpointStats>> {
        if let Some(stats) = self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Some(stats.clone());
        }
        let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        if !endpoints.contains_key(name) && endpoints.len() >= self.config.max_endpoints {
            return None;
        }
        Some(endpoints.entry(name.to_string()).or_default().clone())
    }

    /// Records an attempt; the first attempt also counts as a new invocation.
    pub fn record_attempt(&self, operation: &str, attempt: u32) {
        if attempt <= 1 {
            self.total_invocations.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(stats) = self.operation(operation) {
            if attempt <= 1 {
                stats.invocations.fetch_add(1, Ordering::Relaxed);
            }
            stats.attempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retry(&self, operation: &str) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
        if let Some(stats) = self.operation(operation) {
            stats.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_remote_failure(&self, operation: &str) {
        if let Some(stats) = self.operation(operation) {
            stats.remote_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_success(&self, operation: &str, elapsed: Duration) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        if let Some(stats) = self.operation(operation) {
            stats.successes.fetch_add(1, Ordering::Relaxed);
            stats.latencies.record(elapsed.as_micros() as u64);
        }
    }

    pub fn record_failure(&self, operation: &str, elapsed: Duration) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(stats) = self.operation(operation) {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            stats.latencies.record(elapsed.as_micros() as u64);
        }
    }

    pub fn record_connection(&self, endpoint: &str, established: bool) {
        if let Some(stats) = self.endpoint(endpoint) {
            let counter = if established {
                &stats.established
            } else {
                &stats.failed
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = self
            .operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();
        let endpoints = self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, stats)| {
                (
                    name.clone(),
                    EndpointMetrics {
                        connections_established: stats.established.load(Ordering::Relaxed),
                        connection_failures: stats.failed.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            uptime_ms: self.started.elapsed().as_millis() as u64,
            total_invocations: self.total_invocations.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            operations,
            endpoints,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
