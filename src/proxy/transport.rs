//! SOCKS5 transport layer
//!
//! Establishes connections to origin servers through an upstream SOCKS5
//! proxy, and provides the liveness probe used by the health prober.

use hyper::Uri;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::error::{Result, SpoolError};
use crate::models::Upstream;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;

/// SOCKS5 transport handler
pub struct Socks5Transport;

impl Socks5Transport {
    /// Open a TCP stream to `target_host:target_port` tunneled through the
    /// upstream's SOCKS5 endpoint
    #[instrument(skip(upstream), fields(upstream = %upstream, target = %target_host))]
    pub async fn connect(
        upstream: &Upstream,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        let stream = Socks5Stream::connect(
            (upstream.host.as_str(), upstream.port),
            (target_host, target_port),
        )
        .await
        .map_err(|e| {
            SpoolError::UpstreamConnectFailed(format!(
                "SOCKS5 connect via {} failed: {}",
                upstream, e
            ))
        })?;

        debug!("SOCKS5 connection established");
        Ok(stream.into_inner())
    }

    /// Liveness probe: complete a SOCKS5 method negotiation and nothing more
    ///
    /// No CONNECT is issued, so the probe exercises the upstream without
    /// generating downstream traffic.
    pub async fn probe(upstream: &Upstream) -> Result<()> {
        let mut stream = TcpStream::connect((upstream.host.as_str(), upstream.port))
            .await
            .map_err(|e| {
                SpoolError::UpstreamConnectFailed(format!("{}: dial failed: {}", upstream, e))
            })?;

        stream
            .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
            .await
            .map_err(|e| {
                SpoolError::UpstreamConnectFailed(format!("{}: greeting failed: {}", upstream, e))
            })?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.map_err(|e| {
            SpoolError::UpstreamConnectFailed(format!("{}: no method reply: {}", upstream, e))
        })?;

        if reply != [SOCKS_VERSION, METHOD_NO_AUTH] {
            return Err(SpoolError::UpstreamConnectFailed(format!(
                "{}: unexpected method reply {:02x?}",
                upstream, reply
            )));
        }
        Ok(())
    }

    /// Parse host and port from an absolute-form request URI
    pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
        let host = uri
            .host()
            .ok_or_else(|| SpoolError::InvalidRequest("Missing host in URI".to_string()))?
            .to_string();

        let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });

        Ok((host, port))
    }

    /// Parse host and port from authority form (CONNECT requests)
    pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
        if let Some((host, port_str)) = authority.rsplit_once(':') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| SpoolError::InvalidRequest("Invalid port".to_string()))?;
            Ok((host.to_string(), port))
        } else {
            // CONNECT without a port is almost always HTTPS
            Ok((authority.to_string(), 443))
        }
    }

    /// Parse host and port from a Host header value (origin-form fallback)
    pub fn parse_host_header(value: &str) -> Result<(String, u16)> {
        if let Some((host, port_str)) = value.rsplit_once(':') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| SpoolError::InvalidRequest("Invalid port in Host header".to_string()))?;
            Ok((host.to_string(), port))
        } else {
            Ok((value.to_string(), 80))
        }
    }
}
