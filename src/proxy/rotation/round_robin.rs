//! Round-robin upstream selection

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::UpstreamSelector;
use crate::proxy::registry::UpstreamRecord;

/// Selects upstreams in rotation order
///
/// The cursor is a single process-wide atomic; concurrent callers draw
/// monotonically advancing positions without locking.
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamSelector for RoundRobinSelector {
    fn select(&self, available: &[Arc<UpstreamRecord>]) -> Option<Arc<UpstreamRecord>> {
        if available.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % available.len();
        available.get(idx).cloned()
    }

    fn select_excluding(
        &self,
        available: &[Arc<UpstreamRecord>],
        tried: &HashSet<String>,
    ) -> Option<Arc<UpstreamRecord>> {
        if available.is_empty() {
            return None;
        }
        // len() advances visit every residue once, so a candidate outside
        // `tried` is found iff one exists
        for _ in 0..available.len() {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % available.len();
            let record = &available[idx];
            if !tried.contains(&record.key()) {
                return Some(record.clone());
            }
        }
        None
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
