//! Health probing for upstream SOCKS5 proxies
//!
//! One background scheduler runs two cadences: a full probe of every record
//! on `health_check_interval`, and a cheap rest-expiry sweep on
//! `rest_check_interval` that returns rested upstreams to rotation without
//! re-probing.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::proxy::registry::UpstreamRegistry;
use crate::proxy::transport::Socks5Transport;

const MAX_CONCURRENT_PROBES: usize = 16;

/// Background health prober
pub struct HealthProber {
    registry: Arc<UpstreamRegistry>,
    config: watch::Receiver<Arc<Config>>,
}

impl HealthProber {
    pub fn new(registry: Arc<UpstreamRegistry>, config: watch::Receiver<Arc<Config>>) -> Self {
        Self { registry, config }
    }

    /// Run the prober (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut config = self.config.clone();
        let (mut probe_interval, mut rest_interval) = Self::intervals(&config.borrow());
        info!(
            "Starting health prober ({}s full probe, {}s rest sweep)",
            config.borrow().health_check_interval,
            config.borrow().rest_check_interval()
        );

        loop {
            tokio::select! {
                _ = probe_interval.tick() => {
                    self.probe_all().await;
                }
                _ = rest_interval.tick() => {
                    self.registry.release_rested();
                }
                changed = config.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    (probe_interval, rest_interval) = Self::intervals(&config.borrow());
                    debug!("Prober cadences refreshed from configuration");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health prober shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn intervals(config: &Config) -> (Interval, Interval) {
        (
            Self::make_interval(config.health_check_interval),
            Self::make_interval(config.rest_check_interval()),
        )
    }

    // interval_at so the first tick fires one full period out; upstreams
    // start Available without probing
    fn make_interval(secs: u64) -> Interval {
        let period = Duration::from_secs(secs.max(1));
        interval_at(Instant::now() + period, period)
    }

    /// Probe every record once and apply the transitions
    ///
    /// The registry is only touched before and after the network round; probe
    /// I/O runs on an owned snapshot.
    async fn probe_all(&self) {
        let records = self.registry.snapshot_all();
        if records.is_empty() {
            return;
        }
        let probe_timeout = self.config.borrow().connection_timeout();
        debug!("Probing {} upstreams", records.len());

        let results = futures::stream::iter(records)
            .map(|record| async move {
                let healthy = matches!(
                    tokio::time::timeout(probe_timeout, Socks5Transport::probe(record.upstream()))
                        .await,
                    Ok(Ok(()))
                );
                (record, healthy)
            })
            .buffer_unordered(MAX_CONCURRENT_PROBES)
            .collect::<Vec<_>>()
            .await;

        self.registry.apply_probe_results(&results);

        let healthy = results.iter().filter(|(_, ok)| *ok).count();
        debug!(
            "Probe round complete: {} healthy, {} unhealthy",
            healthy,
            results.len() - healthy
        );
    }
}
