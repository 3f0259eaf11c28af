//! Upstream selection policies
//!
//! This module provides the algorithms for picking an upstream from the
//! available set.

mod random;
mod round_robin;

pub use random::RandomSelector;
pub use round_robin::RoundRobinSelector;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::proxy::registry::UpstreamRecord;

/// Selection algorithm names accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Random,
    RoundRobin,
}

impl Algorithm {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "round-robin" => Self::RoundRobin,
            _ => Self::Random,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::RoundRobin => "round_robin",
        }
    }
}

/// Trait for upstream selection policies
///
/// Selectors are stateless over a registry snapshot; round-robin carries only
/// its monotonic cursor.
pub trait UpstreamSelector: Send + Sync {
    /// Pick an upstream from the available snapshot
    fn select(&self, available: &[Arc<UpstreamRecord>]) -> Option<Arc<UpstreamRecord>>;

    /// Pick an upstream not in `tried` (keys as `host:port`)
    ///
    /// Used by the overload retry loop; round-robin keeps advancing its
    /// cursor past skipped entries.
    fn select_excluding(
        &self,
        available: &[Arc<UpstreamRecord>],
        tried: &HashSet<String>,
    ) -> Option<Arc<UpstreamRecord>>;

    /// Get the algorithm name
    fn name(&self) -> &'static str;
}

/// Create a selector for the given algorithm
pub fn create_selector(algorithm: Algorithm) -> Box<dyn UpstreamSelector> {
    match algorithm {
        Algorithm::Random => Box::new(RandomSelector::new()),
        Algorithm::RoundRobin => Box::new(RoundRobinSelector::new()),
    }
}

/// Process-wide selector handle, swappable on configuration reload
pub struct SharedSelector {
    inner: RwLock<Box<dyn UpstreamSelector>>,
}

impl SharedSelector {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            inner: RwLock::new(create_selector(algorithm)),
        }
    }

    pub fn select(&self, available: &[Arc<UpstreamRecord>]) -> Option<Arc<UpstreamRecord>> {
        self.inner.read().select(available)
    }

    pub fn select_excluding(
        &self,
        available: &[Arc<UpstreamRecord>],
        tried: &HashSet<String>,
    ) -> Option<Arc<UpstreamRecord>> {
        self.inner.read().select_excluding(available, tried)
    }

    pub fn name(&self) -> &'static str {
        self.inner.read().name()
    }

    /// Replace the policy if the algorithm changed
    pub fn swap(&self, algorithm: Algorithm) {
        let mut inner = self.inner.write();
        if inner.name() != algorithm.as_str() {
            info!("Switching load balancing algorithm to {}", algorithm.as_str());
            *inner = create_selector(algorithm);
        }
    }
}
