//! Random upstream selection

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;

use super::UpstreamSelector;
use crate::proxy::registry::UpstreamRecord;

/// Selects a uniformly random upstream from the available set
pub struct RandomSelector;

impl RandomSelector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamSelector for RandomSelector {
    fn select(&self, available: &[Arc<UpstreamRecord>]) -> Option<Arc<UpstreamRecord>> {
        let mut rng = rand::thread_rng();
        available.choose(&mut rng).cloned()
    }

    fn select_excluding(
        &self,
        available: &[Arc<UpstreamRecord>],
        tried: &HashSet<String>,
    ) -> Option<Arc<UpstreamRecord>> {
        let candidates: Vec<&Arc<UpstreamRecord>> = available
            .iter()
            .filter(|record| !tried.contains(&record.key()))
            .collect();
        let mut rng = rand::thread_rng();
        candidates.choose(&mut rng).map(|record| (*record).clone())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Upstream;

    fn records(ports: &[u16]) -> Vec<Arc<UpstreamRecord>> {
        ports
            .iter()
            .map(|&p| Arc::new(UpstreamRecord::new(Upstream::new("127.0.0.1", p))))
            .collect()
    }

    #[test]
    fn test_random_empty() {
        let selector = RandomSelector::new();
        assert!(selector.select(&[]).is_none());
    }

    #[test]
    fn test_random_single() {
        let selector = RandomSelector::new();
        let pool = records(&[8081]);
        assert_eq!(selector.select(&pool).unwrap().upstream().port, 8081);
    }

    #[test]
    fn test_random_within_pool() {
        let selector = RandomSelector::new();
        let pool = records(&[8081, 8082, 8083]);

        for _ in 0..20 {
            let picked = selector.select(&pool).unwrap();
            assert!((8081..=8083).contains(&picked.upstream().port));
        }
    }

    #[test]
    fn test_random_excluding_only_untried() {
        let selector = RandomSelector::new();
        let pool = records(&[8081, 8082, 8083]);

        let mut tried = HashSet::new();
        tried.insert("127.0.0.1:8081".to_string());
        tried.insert("127.0.0.1:8082".to_string());

        for _ in 0..10 {
            let picked = selector.select_excluding(&pool, &tried).unwrap();
            assert_eq!(picked.upstream().port, 8083);
        }

        tried.insert("127.0.0.1:8083".to_string());
        assert!(selector.select_excluding(&pool, &tried).is_none());
    }
}
