//! Observability snapshot types
//!
//! Consumed by the stats reporter; produced by the registry as a consistent
//! point-in-time view.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::UpstreamState;

/// Per-upstream statistics at a moment in time
///
/// A 429 increments `requests` and the overload counter but is neither a
/// success nor a failure; `failures` counts network-class errors only.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamSnapshot {
    pub host: String,
    pub port: u16,
    pub state: UpstreamState,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub overload_count: u32,
    pub sessions_pooled: usize,
    /// Remaining rest period in whole seconds; only set while Resting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rest_remaining_secs: Option<u64>,
}

impl UpstreamSnapshot {
    /// Success rate as a percentage of observed requests
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.successes as f64 / self.requests as f64) * 100.0
        }
    }
}

/// Aggregate view over the whole pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub timestamp: DateTime<Utc>,
    pub algorithm: String,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub overall_success_rate: f64,
    pub available_count: usize,
    pub unavailable_count: usize,
    pub resting_count: usize,
    pub upstreams: Vec<UpstreamSnapshot>,
}

impl PoolSnapshot {
    /// Build the aggregate from per-upstream snapshots
    pub fn from_upstreams(algorithm: String, upstreams: Vec<UpstreamSnapshot>) -> Self {
        let total_requests: u64 = upstreams.iter().map(|u| u.requests).sum();
        let total_successes: u64 = upstreams.iter().map(|u| u.successes).sum();
        let total_failures: u64 = upstreams.iter().map(|u| u.failures).sum();

        let outcomes = total_successes + total_failures;
        let overall_success_rate = if outcomes == 0 {
            0.0
        } else {
            (total_successes as f64 / outcomes as f64) * 100.0
        };

        let count_state = |state: UpstreamState| -> usize {
            upstreams.iter().filter(|u| u.state == state).count()
        };

        Self {
            timestamp: Utc::now(),
            algorithm,
            total_requests,
            total_successes,
            total_failures,
            overall_success_rate,
            available_count: count_state(UpstreamState::Available),
            unavailable_count: count_state(UpstreamState::Unavailable),
            resting_count: count_state(UpstreamState::Resting),
            upstreams,
        }
    }
}
