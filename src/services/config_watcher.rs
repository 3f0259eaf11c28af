//! Configuration hot reload
//!
//! Polls the configuration file's modification time and applies changed
//! documents atomically: the registry reconciles its upstream set, the
//! selector swaps algorithm if needed, and the new snapshot is published to
//! every component holding the watch channel. A file that fails to parse or
//! validate leaves the previous snapshot active.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::proxy::registry::UpstreamRegistry;
use crate::proxy::rotation::{Algorithm, SharedSelector};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Config file watcher service
pub struct ConfigWatcher {
    path: PathBuf,
    registry: Arc<UpstreamRegistry>,
    selector: Arc<SharedSelector>,
    config_tx: watch::Sender<Arc<Config>>,
}

impl ConfigWatcher {
    pub fn new(
        path: PathBuf,
        registry: Arc<UpstreamRegistry>,
        selector: Arc<SharedSelector>,
        config_tx: watch::Sender<Arc<Config>>,
    ) -> Self {
        Self {
            path,
            registry,
            selector,
            config_tx,
        }
    }

    /// Run the watcher (call in a spawned task)
    #[instrument(skip(self, shutdown), fields(path = %self.path.display()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut last_modified = self.modified_at();
        let mut tick = interval(POLL_INTERVAL);
        info!("Watching configuration file for changes");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let modified = self.modified_at();
                    if modified != last_modified {
                        last_modified = modified;
                        self.reload();
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Config watcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn modified_at(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
    }

    /// Load, validate, and apply the configuration file
    fn reload(&self) {
        let config = match Config::load(&self.path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring configuration reload: {}", e);
                return;
            }
        };

        let previous = self.config_tx.borrow().clone();
        if config.listen_addr() != previous.listen_addr() {
            warn!(
                "Listen address changed to {}; a restart is required for it to take effect",
                config.listen_addr()
            );
        }

        self.registry.reconcile(&config);
        self.selector
            .swap(Algorithm::from_str(&config.load_balancing_algorithm));

        let upstreams = config.proxies.len();
        let _ = self.config_tx.send(Arc::new(config));
        info!("Configuration reloaded: {} upstreams", upstreams);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(file: &mut tempfile::NamedTempFile, proxies: &str, algorithm: &str) {
        let raw = format!(
            r#"{{
                "server": {{"host": "127.0.0.1", "port": 8080}},
                "proxies": [{}],
                "load_balancing_algorithm": "{}"
            }}"#,
            proxies, algorithm
        );
        use std::io::Seek;
        file.as_file_mut().set_len(0).unwrap();
        file.as_file_mut().rewind().unwrap();
        file.write_all(raw.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    fn watcher_for(file: &tempfile::NamedTempFile) -> (ConfigWatcher, Arc<UpstreamRegistry>, watch::Receiver<Arc<Config>>) {
        let config = Config::load(file.path()).unwrap();
        let registry = Arc::new(UpstreamRegistry::new(&config));
        let selector = Arc::new(SharedSelector::new(Algorithm::from_str(
            &config.load_balancing_algorithm,
        )));
        let (tx, rx) = watch::channel(Arc::new(config));
        (
            ConfigWatcher::new(file.path().to_path_buf(), registry.clone(), selector, tx),
            registry,
            rx,
        )
    }

    #[test]
    fn test_reload_applies_new_upstreams_and_algorithm() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, r#"{"host": "a", "port": 1080}"#, "random");

        let (watcher, registry, rx) = watcher_for(&file);
        assert_eq!(registry.len(), 1);

        write_config(
            &mut file,
            r#"{"host": "a", "port": 1080}, {"host": "b", "port": 1080}"#,
            "round_robin",
        );
        watcher.reload();

        assert_eq!(registry.len(), 2);
        assert_eq!(watcher.selector.name(), "round_robin");
        assert_eq!(rx.borrow().proxies.len(), 2);
    }

    #[test]
    fn test_reload_keeps_previous_on_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, r#"{"host": "a", "port": 1080}"#, "random");

        let (watcher, registry, rx) = watcher_for(&file);

        file.as_file_mut().set_len(0).unwrap();
        use std::io::Seek;
        file.as_file_mut().rewind().unwrap();
        file.write_all(b"{broken").unwrap();
        file.flush().unwrap();
        watcher.reload();

        // registry and published snapshot are untouched
        assert_eq!(registry.len(), 1);
        assert_eq!(rx.borrow().proxies.len(), 1);
        assert_eq!(watcher.selector.name(), "random");
    }

    #[test]
    fn test_modified_at_missing_file() {
        let (watcher, _, _) = {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            write_config(&mut file, r#"{"host": "a", "port": 1080}"#, "random");
            let (w, r, rx) = watcher_for(&file);
            // file is deleted when it goes out of scope
            (w, r, rx)
        };
        assert!(watcher.modified_at().is_none());
    }
}
