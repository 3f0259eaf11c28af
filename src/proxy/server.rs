//! Proxy server implementation using hyper
//!
//! Accepts client connections and serves them with the proxy handler over
//! HTTP/1.1, including CONNECT upgrades and persistent connections.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SpoolError};
use crate::proxy::handler::ProxyHandler;

/// Bounded grace for in-flight requests on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Proxy server
pub struct ProxyServer {
    listen_addr: String,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(listen_addr: String, handler: Arc<ProxyHandler>) -> Self {
        Self {
            listen_addr,
            handler,
        }
    }

    /// Run the accept loop until shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self
            .listen_addr
            .parse()
            .map_err(|_| SpoolError::InvalidConfig(format!("bad listen address {}", self.listen_addr)))?;

        let listener = TcpListener::bind(addr).await?;
        info!("Proxy server listening on {}", addr);

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            connections.spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, handler).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                // reap finished connection tasks so the set stays bounded
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        if !connections.is_empty() {
            info!(
                "Waiting up to {}s for {} open connections",
                SHUTDOWN_GRACE.as_secs(),
                connections.len()
            );
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Grace period expired, closing {} connections", connections.len());
                connections.abort_all();
            }
        }

        Ok(())
    }

    /// Handle a single client connection
    async fn handle_connection(
        stream: tokio::net::TcpStream,
        client_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
    ) -> Result<()> {
        debug!("Accepted connection from {}", client_addr);
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move {
                match handler.handle(req).await {
                    Ok(response) => Ok::<_, Infallible>(response),
                    Err(e) => {
                        error!("Request handling error: {}", e);
                        Ok(Response::builder()
                            .status(e.status_code())
                            .body(Full::new(Bytes::from(e.to_string())))
                            .unwrap())
                    }
                }
            }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| SpoolError::Http(e.to_string()))?;

        Ok(())
    }
}
