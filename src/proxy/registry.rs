//! Upstream registry
//!
//! Holds every configured SOCKS5 upstream together with its lifecycle state,
//! counters, and session pool. The three state sets (available, unavailable,
//! resting) are derived from a per-record state field; transitions are
//! serialized by a per-record lock and never block on network I/O.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{PoolSnapshot, Upstream, UpstreamSnapshot, UpstreamState};
use crate::proxy::session::SessionPool;

/// Transition tuning, refreshed when the configuration is reloaded
#[derive(Debug, Clone)]
struct Tuning {
    max_retries: u32,
    backoff_base: Duration,
    rest_cap: Duration,
}

impl Tuning {
    fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: config.overload_backoff_base(),
            rest_cap: config.rest_cap(),
        }
    }
}

#[derive(Debug, Default)]
struct RecordState {
    state: UpstreamState,
    rest_until: Option<Instant>,
    request_count: u64,
    success_count: u64,
    failure_count: u64,
    consecutive_failures: u32,
    overload_count: u32,
}

/// One upstream with its mutable lifecycle state and session pool
pub struct UpstreamRecord {
    upstream: Upstream,
    state: Mutex<RecordState>,
    sessions: SessionPool,
}

impl UpstreamRecord {
    pub(crate) fn new(upstream: Upstream) -> Self {
        Self {
            upstream,
            state: Mutex::new(RecordState::default()),
            sessions: SessionPool::new(),
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn key(&self) -> String {
        self.upstream.key()
    }

    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    pub fn current_state(&self) -> UpstreamState {
        self.state.lock().state
    }

    fn snapshot(&self, now: Instant) -> UpstreamSnapshot {
        let state = self.state.lock();
        let rest_remaining_secs = match state.state {
            UpstreamState::Resting => state
                .rest_until
                .map(|until| until.saturating_duration_since(now).as_secs()),
            _ => None,
        };
        UpstreamSnapshot {
            host: self.upstream.host.clone(),
            port: self.upstream.port,
            state: state.state,
            requests: state.request_count,
            successes: state.success_count,
            failures: state.failure_count,
            consecutive_failures: state.consecutive_failures,
            overload_count: state.overload_count,
            sessions_pooled: self.sessions.len(),
            rest_remaining_secs,
        }
    }

    /// Leave Resting once the rest period has elapsed
    ///
    /// Consecutive failures are cleared, the overload counter is not: only an
    /// observed non-429 success resets it, so a repeat 429 after expiry rests
    /// for twice as long.
    fn promote_if_rested(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.state != UpstreamState::Resting {
            return false;
        }
        match state.rest_until {
            Some(until) if until <= now => {
                state.state = UpstreamState::Available;
                state.rest_until = None;
                state.consecutive_failures = 0;
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn force_resting(&self, rest_until: Instant) {
        let mut state = self.state.lock();
        state.state = UpstreamState::Resting;
        state.rest_until = Some(rest_until);
    }
}

/// Concurrency-safe collection of upstream records
///
/// The record list preserves configuration order, which is what round-robin
/// iterates over. Snapshots are plain `Arc` clones and safe to hold across
/// I/O.
pub struct UpstreamRegistry {
    records: RwLock<Vec<Arc<UpstreamRecord>>>,
    tuning: RwLock<Tuning>,
}

impl UpstreamRegistry {
    /// Build the registry from a configuration snapshot; every upstream
    /// starts Available without probing
    pub fn new(config: &Config) -> Self {
        let mut records: Vec<Arc<UpstreamRecord>> = Vec::with_capacity(config.proxies.len());
        for proxy in &config.proxies {
            if records.iter().any(|r| r.key() == proxy.key()) {
                warn!("Ignoring duplicate upstream {}", proxy.key());
                continue;
            }
            records.push(Arc::new(UpstreamRecord::new(proxy.to_upstream())));
        }
        Self {
            records: RwLock::new(records),
            tuning: RwLock::new(Tuning::from_config(config)),
        }
    }

    /// Ordered list of Available records
    ///
    /// Resting records whose rest period has elapsed are promoted on the way
    /// through, so selection pressure does not have to wait for the prober.
    pub fn snapshot_available(&self) -> Vec<Arc<UpstreamRecord>> {
        let now = Instant::now();
        let records = self.records.read();
        records
            .iter()
            .filter(|record| {
                if record.promote_if_rested(now) {
                    info!("Upstream {} rest period expired, back in rotation", record.key());
                }
                record.current_state().is_available()
            })
            .cloned()
            .collect()
    }

    /// Every record regardless of state
    pub fn snapshot_all(&self) -> Vec<Arc<UpstreamRecord>> {
        self.records.read().clone()
    }

    /// Count a selection against the record
    pub fn note_request(&self, record: &UpstreamRecord) {
        record.state.lock().request_count += 1;
    }

    /// Record a non-429 response; promotes the upstream back to Available
    pub fn mark_success(&self, record: &UpstreamRecord) {
        let mut state = record.state.lock();
        state.success_count += 1;
        state.consecutive_failures = 0;
        state.overload_count = 0;
        state.rest_until = None;
        if state.state != UpstreamState::Available {
            info!(
                "Upstream {} restored to available pool ({} -> available)",
                record.key(),
                state.state
            );
            state.state = UpstreamState::Available;
        }
        debug!(
            "Upstream {} success (total: {})",
            record.key(),
            state.success_count
        );
    }

    /// Record a network-class error; demotes after too many in a row
    pub fn mark_failure(&self, record: &UpstreamRecord) {
        let max_retries = self.tuning.read().max_retries;
        let mut state = record.state.lock();
        state.failure_count += 1;
        state.consecutive_failures += 1;
        warn!(
            "Upstream {} failed (failure #{})",
            record.key(),
            state.consecutive_failures
        );
        if state.state == UpstreamState::Available && state.consecutive_failures >= max_retries {
            state.state = UpstreamState::Unavailable;
            warn!(
                "Upstream {} marked unavailable after {} consecutive failures",
                record.key(),
                state.consecutive_failures
            );
        }
    }

    /// Record a 429; rests the upstream with exponential backoff
    pub fn mark_overloaded(&self, record: &UpstreamRecord) {
        let tuning = self.tuning.read().clone();
        let mut state = record.state.lock();
        state.overload_count += 1;
        let rest = Self::rest_duration(state.overload_count, &tuning);
        state.rest_until = Some(Instant::now() + rest);
        state.state = UpstreamState::Resting;
        warn!(
            "Upstream {} overloaded (429 #{}), resting for {}s",
            record.key(),
            state.overload_count,
            rest.as_secs()
        );
    }

    /// `base * 2^(overload_count - 1)`, capped by `proxy_rest_duration`
    fn rest_duration(overload_count: u32, tuning: &Tuning) -> Duration {
        let exponent = overload_count.saturating_sub(1).min(31);
        tuning
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(tuning.rest_cap)
    }

    /// Apply a finished probe round
    ///
    /// Available records that failed their probe become Unavailable;
    /// Unavailable records that passed come back with a clean failure streak.
    /// Resting records are left to the rest-expiry pass regardless of probe
    /// outcome.
    pub fn apply_probe_results(&self, results: &[(Arc<UpstreamRecord>, bool)]) {
        for (record, healthy) in results {
            let mut state = record.state.lock();
            match (state.state, healthy) {
                (UpstreamState::Available, false) => {
                    state.state = UpstreamState::Unavailable;
                    warn!("Upstream {} failed health probe", record.key());
                }
                (UpstreamState::Unavailable, true) => {
                    state.state = UpstreamState::Available;
                    state.consecutive_failures = 0;
                    info!("Upstream {} restored via health probe", record.key());
                }
                _ => {}
            }
        }
    }

    /// Promote every Resting record whose rest period has elapsed
    pub fn release_rested(&self) {
        let now = Instant::now();
        for record in self.records.read().iter() {
            if record.promote_if_rested(now) {
                info!("Upstream {} rest period expired, back in rotation", record.key());
            }
        }
    }

    /// Reconcile the registry against a new configuration snapshot
    ///
    /// Kept records preserve their state and counters; new keys join as
    /// Available; removed keys are dropped (in-flight requests holding the
    /// record finish against the orphaned entry).
    pub fn reconcile(&self, config: &Config) {
        *self.tuning.write() = Tuning::from_config(config);

        let mut records = self.records.write();
        let mut next: Vec<Arc<UpstreamRecord>> = Vec::with_capacity(config.proxies.len());
        let mut added = 0usize;
        for proxy in &config.proxies {
            if next.iter().any(|r| r.key() == proxy.key()) {
                warn!("Ignoring duplicate upstream {}", proxy.key());
                continue;
            }
            match records.iter().find(|r| r.key() == proxy.key()) {
                Some(existing) => next.push(existing.clone()),
                None => {
                    next.push(Arc::new(UpstreamRecord::new(proxy.to_upstream())));
                    added += 1;
                }
            }
        }
        let removed = records
            .iter()
            .filter(|r| !next.iter().any(|n| n.key() == r.key()))
            .count();
        *records = next;
        info!(
            "Registry reconciled: {} upstreams ({} added, {} removed)",
            records.len(),
            added,
            removed
        );
    }

    /// Consistent point-in-time view for the stats reporter
    pub fn stats(&self, algorithm: &str) -> PoolSnapshot {
        let now = Instant::now();
        let upstreams = self
            .records
            .read()
            .iter()
            .map(|record| record.snapshot(now))
            .collect();
        PoolSnapshot::from_upstreams(algorithm.to_string(), upstreams)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(hosts: &[(&str, u16)]) -> Config {
        let proxies: Vec<String> = hosts
            .iter()
            .map(|(h, p)| format!("{{\"host\": \"{}\", \"port\": {}}}", h, p))
            .collect();
        let raw = format!(
            r#"{{
                "server": {{"host": "127.0.0.1", "port": 8080}},
                "proxies": [{}],
                "max_retries": 3,
                "overload_backoff_base_secs": 30,
                "proxy_rest_duration": 300
            }}"#,
            proxies.join(",")
        );
        Config::from_json(&raw).unwrap()
    }

    fn registry(hosts: &[(&str, u16)]) -> UpstreamRegistry {
        UpstreamRegistry::new(&test_config(hosts))
    }

    #[test]
    fn test_new_registry_all_available() {
        let registry = registry(&[("a", 1080), ("b", 1080)]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot_available().len(), 2);
    }

    #[test]
    fn test_duplicate_upstreams_collapsed() {
        let registry = registry(&[("a", 1080), ("a", 1080), ("b", 1080)]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_snapshot_preserves_config_order() {
        let registry = registry(&[("c", 1), ("a", 2), ("b", 3)]);
        let keys: Vec<String> = registry
            .snapshot_available()
            .iter()
            .map(|r| r.key())
            .collect();
        assert_eq!(keys, vec!["c:1", "a:2", "b:3"]);
    }

    #[test]
    fn test_mark_failure_demotes_after_max_retries() {
        let registry = registry(&[("a", 1080)]);
        let record = registry.snapshot_all()[0].clone();

        registry.mark_failure(&record);
        registry.mark_failure(&record);
        assert_eq!(record.current_state(), UpstreamState::Available);

        registry.mark_failure(&record);
        assert_eq!(record.current_state(), UpstreamState::Unavailable);
        assert!(registry.snapshot_available().is_empty());

        let snapshot = record.snapshot(Instant::now());
        assert_eq!(snapshot.failures, 3);
        assert_eq!(snapshot.consecutive_failures, 3);
    }

    #[test]
    fn test_mark_success_resets_and_promotes() {
        let registry = registry(&[("a", 1080)]);
        let record = registry.snapshot_all()[0].clone();

        registry.mark_failure(&record);
        registry.mark_failure(&record);
        registry.mark_failure(&record);
        assert_eq!(record.current_state(), UpstreamState::Unavailable);

        registry.mark_success(&record);
        assert_eq!(record.current_state(), UpstreamState::Available);

        let snapshot = record.snapshot(Instant::now());
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.overload_count, 0);
        assert_eq!(snapshot.successes, 1);
        // total failures are history, not state
        assert_eq!(snapshot.failures, 3);
    }

    #[test]
    fn test_mark_overloaded_rests_with_exponential_backoff() {
        let registry = registry(&[("a", 1080)]);
        let record = registry.snapshot_all()[0].clone();

        registry.mark_overloaded(&record);
        assert_eq!(record.current_state(), UpstreamState::Resting);
        let snapshot = record.snapshot(Instant::now());
        assert_eq!(snapshot.overload_count, 1);
        // first rest is one full base period
        let remaining = snapshot.rest_remaining_secs.unwrap();
        assert!(remaining >= 28 && remaining <= 30, "remaining={}", remaining);

        registry.mark_overloaded(&record);
        let snapshot = record.snapshot(Instant::now());
        assert_eq!(snapshot.overload_count, 2);
        let remaining = snapshot.rest_remaining_secs.unwrap();
        assert!(remaining >= 58 && remaining <= 60, "remaining={}", remaining);
    }

    #[test]
    fn test_rest_duration_series_and_cap() {
        let tuning = Tuning {
            max_retries: 3,
            backoff_base: Duration::from_secs(30),
            rest_cap: Duration::from_secs(300),
        };
        assert_eq!(UpstreamRegistry::rest_duration(1, &tuning).as_secs(), 30);
        assert_eq!(UpstreamRegistry::rest_duration(2, &tuning).as_secs(), 60);
        assert_eq!(UpstreamRegistry::rest_duration(3, &tuning).as_secs(), 120);
        assert_eq!(UpstreamRegistry::rest_duration(4, &tuning).as_secs(), 240);
        // cap engages from the fifth consecutive 429
        assert_eq!(UpstreamRegistry::rest_duration(5, &tuning).as_secs(), 300);
        assert_eq!(UpstreamRegistry::rest_duration(60, &tuning).as_secs(), 300);
    }

    #[test]
    fn test_release_rested_preserves_overload_count() {
        let registry = registry(&[("a", 1080)]);
        let record = registry.snapshot_all()[0].clone();

        registry.mark_overloaded(&record);
        record.force_resting(Instant::now() - Duration::from_secs(1));

        registry.release_rested();
        assert_eq!(record.current_state(), UpstreamState::Available);
        let snapshot = record.snapshot(Instant::now());
        assert_eq!(snapshot.consecutive_failures, 0);
        // expiry alone does not forgive the overload streak
        assert_eq!(snapshot.overload_count, 1);
    }

    #[test]
    fn test_release_rested_ignores_future_rest_until() {
        let registry = registry(&[("a", 1080)]);
        let record = registry.snapshot_all()[0].clone();

        record.force_resting(Instant::now() + Duration::from_secs(60));
        registry.release_rested();
        assert_eq!(record.current_state(), UpstreamState::Resting);
    }

    #[test]
    fn test_snapshot_available_promotes_expired_resting() {
        let registry = registry(&[("a", 1080)]);
        let record = registry.snapshot_all()[0].clone();

        record.force_resting(Instant::now() - Duration::from_secs(1));
        let available = registry.snapshot_available();
        assert_eq!(available.len(), 1);
        assert_eq!(record.current_state(), UpstreamState::Available);
    }

    #[test]
    fn test_probe_results_transitions() {
        let registry = registry(&[("a", 1080), ("b", 1080), ("c", 1080)]);
        let records = registry.snapshot_all();

        // b is already unavailable, c is resting
        registry.mark_failure(&records[1]);
        registry.mark_failure(&records[1]);
        registry.mark_failure(&records[1]);
        registry.mark_overloaded(&records[2]);

        registry.apply_probe_results(&[
            (records[0].clone(), false),
            (records[1].clone(), true),
            (records[2].clone(), true),
        ]);

        assert_eq!(records[0].current_state(), UpstreamState::Unavailable);
        assert_eq!(records[1].current_state(), UpstreamState::Available);
        assert_eq!(
            records[1].snapshot(Instant::now()).consecutive_failures,
            0
        );
        // probes never promote a resting record
        assert_eq!(records[2].current_state(), UpstreamState::Resting);
    }

    #[test]
    fn test_reconcile_keeps_counters_adds_and_drops() {
        let registry = registry(&[("a", 1080), ("b", 1080)]);
        let record_a = registry.snapshot_all()[0].clone();
        registry.note_request(&record_a);
        registry.mark_success(&record_a);

        registry.reconcile(&test_config(&[("a", 1080), ("c", 1080)]));

        let keys: Vec<String> = registry.snapshot_all().iter().map(|r| r.key()).collect();
        assert_eq!(keys, vec!["a:1080", "c:1080"]);

        let kept = &registry.snapshot_all()[0];
        let snapshot = kept.snapshot(Instant::now());
        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.successes, 1);

        let added = &registry.snapshot_all()[1];
        assert_eq!(added.current_state(), UpstreamState::Available);
        assert_eq!(added.snapshot(Instant::now()).requests, 0);
    }

    #[test]
    fn test_concurrent_overloads_increment_linearizably() {
        let registry = Arc::new(registry(&[("a", 1080)]));
        let record = registry.snapshot_all()[0].clone();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let record = record.clone();
                std::thread::spawn(move || registry.mark_overloaded(&record))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = record.snapshot(Instant::now());
        assert_eq!(snapshot.overload_count, 8);
        assert_eq!(record.current_state(), UpstreamState::Resting);
        assert!(snapshot.rest_remaining_secs.is_some());
    }

    #[test]
    fn test_stats_snapshot_counts_states() {
        let registry = registry(&[("a", 1080), ("b", 1080), ("c", 1080)]);
        let records = registry.snapshot_all();

        registry.note_request(&records[0]);
        registry.mark_success(&records[0]);
        for _ in 0..3 {
            registry.note_request(&records[1]);
            registry.mark_failure(&records[1]);
        }
        registry.note_request(&records[2]);
        registry.mark_overloaded(&records[2]);

        let stats = registry.stats("round_robin");
        assert_eq!(stats.algorithm, "round_robin");
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 3);
        assert_eq!(stats.available_count, 1);
        assert_eq!(stats.unavailable_count, 1);
        assert_eq!(stats.resting_count, 1);
        assert_eq!(stats.upstreams.len(), 3);
    }
}
