//! Spool proxy balancer - Entry Point
//!
//! Starts the proxy server, health prober, stats reporter, and config
//! watcher with graceful shutdown support.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod models;
mod proxy;
mod services;

use config::Config;
use proxy::handler::ProxyHandler;
use proxy::health::HealthProber;
use proxy::registry::UpstreamRegistry;
use proxy::rotation::{Algorithm, SharedSelector};
use proxy::server::ProxyServer;
use services::{ConfigWatcher, StatsReporter};

/// HTTP(S) forward proxy balancing traffic across a pool of SOCKS5 upstreams
#[derive(Parser, Debug)]
#[command(name = "spool", version, about)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> error::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let default_filter = if args.verbose { "spool=debug" } else { "spool=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Spool proxy balancer");

    // Load configuration
    let config = Config::load(&args.config)?;
    info!(
        "Loaded {} upstreams from {}",
        config.proxies.len(),
        args.config.display()
    );

    // Create the registry and selection policy
    let registry = Arc::new(UpstreamRegistry::new(&config));
    let algorithm = Algorithm::from_str(&config.load_balancing_algorithm);
    let selector = Arc::new(SharedSelector::new(algorithm));
    info!("Using load balancing algorithm: {}", algorithm.as_str());

    let listen_addr = config.listen_addr();
    let (config_tx, config_rx) = watch::channel(Arc::new(config));

    // Create shutdown channel
    let (shutdown_tx, _) = watch::channel(false);

    // Start health prober
    let prober = HealthProber::new(registry.clone(), config_rx.clone());
    let prober_shutdown = shutdown_tx.subscribe();
    let prober_task = tokio::spawn(async move {
        prober.run(prober_shutdown).await;
    });

    // Start stats reporter
    let reporter = StatsReporter::new(registry.clone(), selector.clone(), config_rx.clone());
    let reporter_shutdown = shutdown_tx.subscribe();
    let reporter_task = tokio::spawn(async move {
        reporter.run(reporter_shutdown).await;
    });

    // Start config watcher
    let watcher = ConfigWatcher::new(
        args.config.clone(),
        registry.clone(),
        selector.clone(),
        config_tx,
    );
    let watcher_shutdown = shutdown_tx.subscribe();
    let watcher_task = tokio::spawn(async move {
        watcher.run(watcher_shutdown).await;
    });

    // Start proxy server
    let handler = Arc::new(ProxyHandler::new(
        registry.clone(),
        selector.clone(),
        config_rx.clone(),
    ));
    let server = ProxyServer::new(listen_addr, handler);
    let server_shutdown = shutdown_tx.subscribe();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(server_shutdown).await {
            error!("Proxy server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(server_task, prober_task, reporter_task, watcher_task);

    info!("Spool proxy balancer stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
