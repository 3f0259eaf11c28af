//! Periodic statistics reporter
//!
//! Pulls a consistent snapshot from the registry on a fixed cadence and
//! emits a summary through the log. Per-upstream lines go out at debug
//! level.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::models::PoolSnapshot;
use crate::proxy::registry::UpstreamRegistry;
use crate::proxy::rotation::SharedSelector;

/// Stats reporter service
pub struct StatsReporter {
    registry: Arc<UpstreamRegistry>,
    selector: Arc<SharedSelector>,
    config: watch::Receiver<Arc<Config>>,
}

impl StatsReporter {
    pub fn new(
        registry: Arc<UpstreamRegistry>,
        selector: Arc<SharedSelector>,
        config: watch::Receiver<Arc<Config>>,
    ) -> Self {
        Self {
            registry,
            selector,
            config,
        }
    }

    /// Run the reporter (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut config = self.config.clone();
        let mut tick = Self::make_interval(&config.borrow());
        info!(
            "Starting stats reporter ({}s interval)",
            config.borrow().stats_interval
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.report();
                }
                changed = config.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    tick = Self::make_interval(&config.borrow());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Stats reporter shutting down");
                        break;
                    }
                }
            }
        }

        // final summary on the way out
        self.report();
    }

    fn make_interval(config: &Config) -> tokio::time::Interval {
        let period = Duration::from_secs(config.stats_interval.max(1));
        let mut tick = interval(period);
        tick.reset();
        tick
    }

    fn report(&self) {
        let snapshot = self.registry.stats(self.selector.name());
        Self::log_snapshot(&snapshot);
    }

    fn log_snapshot(snapshot: &PoolSnapshot) {
        info!(
            "Stats Summary - Algorithm: {}, Requests: {}, Success Rate: {:.1}%, Upstreams: {} available / {} unavailable / {} resting",
            snapshot.algorithm,
            snapshot.total_requests,
            snapshot.overall_success_rate,
            snapshot.available_count,
            snapshot.unavailable_count,
            snapshot.resting_count
        );
        for upstream in &snapshot.upstreams {
            debug!(
                "  {}:{} [{}] {} reqs, {} ok, {} failed ({} consecutive), {} overloads, {} pooled sessions{}",
                upstream.host,
                upstream.port,
                upstream.state,
                upstream.requests,
                upstream.successes,
                upstream.failures,
                upstream.consecutive_failures,
                upstream.overload_count,
                upstream.sessions_pooled,
                match upstream.rest_remaining_secs {
                    Some(secs) => format!(", resting {}s more", secs),
                    None => String::new(),
                }
            );
        }
    }
}
