//! Proxy request handler
//!
//! Drives the per-request state machine: select an upstream, forward the
//! HTTP transaction or CONNECT tunnel through its SOCKS5 endpoint, classify
//! the outcome, and feed the result back into the registry. A 429 from the
//! origin puts the upstream to rest and moves the request on to the next
//! candidate; transport errors surface to the client as 502 so callers can
//! apply their own retry policy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderMap, CONNECTION, HOST};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{Result, SpoolError};
use crate::proxy::registry::{UpstreamRecord, UpstreamRegistry};
use crate::proxy::rotation::SharedSelector;
use crate::proxy::transport::Socks5Transport;
use crate::proxy::tunnel::{self, TunnelOutcome};

/// Proxy request handler
pub struct ProxyHandler {
    registry: Arc<UpstreamRegistry>,
    selector: Arc<SharedSelector>,
    config: watch::Receiver<Arc<Config>>,
}

impl ProxyHandler {
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

    /// Handle an incoming proxy request
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }
        self.handle_http(req).await
    }

    /// Handle HTTP CONNECT (HTTPS tunneling)
    #[instrument(skip(self, req), fields(uri = %req.uri()))]
    async fn handle_connect<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body + Send + 'static,
    {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());
        let (target_host, target_port) = Socks5Transport::parse_authority(&authority)?;

        let io_timeout = self.config.borrow().connection_timeout();

        let available = self.registry.snapshot_available();
        let Some(record) = self.selector.select(&available) else {
            info!("No upstreams available for CONNECT to {}", authority);
            return Ok(self.error_response(StatusCode::SERVICE_UNAVAILABLE, "No upstreams available"));
        };
        self.registry.note_request(&record);

        debug!(
            "CONNECT to {}:{} through upstream {}",
            target_host, target_port, record.key()
        );

        let upstream_stream = match timeout(
            io_timeout,
            Socks5Transport::connect(record.upstream(), &target_host, target_port),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("CONNECT through {} failed: {}", record.key(), e);
                self.registry.mark_failure(&record);
                return Ok(self.error_response(StatusCode::BAD_GATEWAY, "Tunnel establishment failed"));
            }
            Err(_) => {
                warn!("CONNECT through {} timed out", record.key());
                self.registry.mark_failure(&record);
                return Ok(self.error_response(StatusCode::BAD_GATEWAY, "Tunnel establishment timed out"));
            }
        };

        // The tunnel runs on the upgraded connection after the 200 goes out
        let registry = self.registry.clone();
        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    match tunnel::splice(TokioIo::new(upgraded), upstream_stream).await {
                        TunnelOutcome::Closed { .. } => registry.mark_success(&record),
                        TunnelOutcome::UpstreamError(e) => {
                            warn!("Tunnel through {} failed mid-stream: {}", record.key(), e);
                            registry.mark_failure(&record);
                        }
                        TunnelOutcome::ClientAbort => {
                            debug!("Client left tunnel through {}", record.key());
                        }
                    }
                }
                Err(e) => debug!("Client abandoned CONNECT before upgrade: {}", e),
            }
        });

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .unwrap();
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        Ok(response)
    }

    /// Handle a plain HTTP request
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    async fn handle_http<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let io_timeout = self.config.borrow().connection_timeout();

        let (parts, body) = req.into_parts();

        // Absolute-form URI, with origin-form + Host as a fallback
        let (target_host, target_port) = match parts.uri.host() {
            Some(_) => Socks5Transport::parse_target(&parts.uri)?,
            None => {
                let host = parts
                    .headers
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        SpoolError::InvalidRequest("Missing host in URI and Host header".to_string())
                    })?;
                Socks5Transport::parse_host_header(host)?
            }
        };

        let body_bytes = body
            .collect()
            .await
            .map_err(|e| SpoolError::InvalidRequest(format!("Failed to read body: {}", e)))?
            .to_bytes();

        let available = self.registry.snapshot_available();
        let Some(record) = self.selector.select(&available) else {
            info!("No upstreams available for {} {}", parts.method, parts.uri);
            return Ok(self.error_response(StatusCode::SERVICE_UNAVAILABLE, "No upstreams available"));
        };
        self.registry.note_request(&record);

        match self
            .send_via(&record, &parts, body_bytes.clone(), &target_host, target_port, io_timeout)
            .await
        {
            Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                self.registry.mark_overloaded(&record);
                self.retry_overloaded(
                    &parts,
                    body_bytes,
                    &target_host,
                    target_port,
                    io_timeout,
                    record,
                    response,
                )
                .await
            }
            Ok(response) => {
                self.registry.mark_success(&record);
                Ok(response)
            }
            Err(e) => {
                // transport failures on the first attempt surface promptly
                warn!("Request through {} failed: {}", record.key(), e);
                self.registry.mark_failure(&record);
                Ok(self.error_response(StatusCode::BAD_GATEWAY, "Upstream request failed"))
            }
        }
    }

    /// Walk the remaining candidates after a 429
    ///
    /// Overloaded and failed candidates are excluded for the rest of this
    /// request; the terminal status is 429 if the last observed outcome was
    /// an overload, 502 otherwise.
    #[allow(clippy::too_many_arguments)]
    async fn retry_overloaded(
        &self,
        parts: &http::request::Parts,
        body: Bytes,
        target_host: &str,
        target_port: u16,
        io_timeout: Duration,
        first: Arc<UpstreamRecord>,
        first_response: Response<Full<Bytes>>,
    ) -> Result<Response<Full<Bytes>>> {
        let mut tried = HashSet::new();
        tried.insert(first.key());
        let mut last_overloaded = Some(first_response);

        loop {
            let available = self.registry.snapshot_available();
            let Some(candidate) = self.selector.select_excluding(&available, &tried) else {
                break;
            };
            self.registry.note_request(&candidate);
            debug!(
                "Retrying {} {} through upstream {} ({} tried)",
                parts.method,
                parts.uri,
                candidate.key(),
                tried.len()
            );

            match self
                .send_via(&candidate, parts, body.clone(), target_host, target_port, io_timeout)
                .await
            {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    self.registry.mark_overloaded(&candidate);
                    tried.insert(candidate.key());
                    last_overloaded = Some(response);
                }
                Ok(response) => {
                    self.registry.mark_success(&candidate);
                    return Ok(response);
                }
                Err(e) => {
                    warn!("Retry through {} failed: {}", candidate.key(), e);
                    self.registry.mark_failure(&candidate);
                    tried.insert(candidate.key());
                    last_overloaded = None;
                }
            }
        }

        match last_overloaded {
            Some(response) => {
                warn!("All candidates overloaded for {} {}", parts.method, parts.uri);
                Ok(response)
            }
            None => Ok(self.error_response(StatusCode::BAD_GATEWAY, "All upstreams failed")),
        }
    }

    /// One HTTP transaction through one upstream
    async fn send_via(
        &self,
        record: &UpstreamRecord,
        parts: &http::request::Parts,
        body: Bytes,
        target_host: &str,
        target_port: u16,
        io_timeout: Duration,
    ) -> Result<Response<Full<Bytes>>> {
        let mut sender = match record.sessions().check_out(target_host, target_port) {
            Some(sender) => {
                debug!("Reusing pooled session to {}:{}", target_host, target_port);
                sender
            }
            None => {
                let stream = timeout(
                    io_timeout,
                    Socks5Transport::connect(record.upstream(), target_host, target_port),
                )
                .await
                .map_err(|_| SpoolError::Timeout)??;

                let io = TokioIo::new(stream);
                let (sender, conn) =
                    hyper::client::conn::http1::handshake::<_, Full<Bytes>>(io)
                        .await
                        .map_err(|e| {
                            SpoolError::UpstreamConnectFailed(format!("Handshake failed: {}", e))
                        })?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("Upstream connection ended: {}", e);
                    }
                });
                sender
            }
        };

        let request = Self::build_upstream_request(parts, body, target_host, target_port)?;

        let response = timeout(io_timeout, sender.send_request(request))
            .await
            .map_err(|_| SpoolError::Timeout)?
            .map_err(|e| SpoolError::UpstreamRequestFailed(format!("Send failed: {}", e)))?;

        let (mut response_parts, response_body) = response.into_parts();
        let response_bytes = timeout(io_timeout, response_body.collect())
            .await
            .map_err(|_| SpoolError::Timeout)?
            .map_err(|e| {
                SpoolError::UpstreamRequestFailed(format!("Failed to read response: {}", e))
            })?
            .to_bytes();

        // the origin announced it will close; the session is not reusable
        let keep_alive = !response_parts
            .headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.eq_ignore_ascii_case("close"));

        strip_hop_by_hop(&mut response_parts.headers);
        if keep_alive {
            record
                .sessions()
                .check_in(target_host, target_port, sender);
        }

        Ok(Response::from_parts(response_parts, Full::new(response_bytes)))
    }

    /// Rewrite the client's request for the origin: origin-form URI, fresh
    /// Host header, hop-by-hop headers dropped
    fn build_upstream_request(
        parts: &http::request::Parts,
        body: Bytes,
        target_host: &str,
        target_port: u16,
    ) -> Result<Request<Full<Bytes>>> {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut builder = Request::builder().method(parts.method.clone()).uri(path);
        for (name, value) in &parts.headers {
            if *name != HOST && !is_hop_by_hop_header(name.as_str()) {
                builder = builder.header(name, value);
            }
        }
        let host_value = if target_port == 80 {
            target_host.to_string()
        } else {
            format!("{}:{}", target_host, target_port)
        };
        builder = builder.header(HOST, host_value);

        builder
            .body(Full::new(body))
            .map_err(|e| SpoolError::InvalidRequest(format!("Failed to build request: {}", e)))
    }

    /// Create an error response
    fn error_response(&self, status: StatusCode, message: &str) -> Response<Full<Bytes>> {
        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from(message.to_string())))
            .unwrap()
    }
}

/// Check if a header is hop-by-hop and must not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-authorization"
            | "proxy-authenticate"
    )
}

/// Remove hop-by-hop headers in place (response direction)
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let doomed: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}
