// Copyright 2025 Lodestar Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metrics for a single operation name
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct OperationMetrics {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub attempts: u64,
    pub retries: u64,
    pub remote_failures: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Connection statistics for one endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EndpointMetrics {
    pub connections_established: u64,
    pub connection_failures: u64,
}

/// Point-in-time copy of everything a [`MetricsObserver`](crate::MetricsObserver) recorded
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub uptime_ms: u64,
    pub total_invocations: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_retries: u64,
    pub operations: HashMap<String, OperationMetrics>,
    pub endpoints: HashMap<String, EndpointMetrics>,
}
