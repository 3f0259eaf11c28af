//! Proxy server implementation
//!
//! This module provides the balancer's request path:
//! - HTTP forwarding through SOCKS5 upstreams
//! - CONNECT tunnels for HTTPS
//! - The upstream registry with its three-state lifecycle
//! - Selection policies and health probing

pub mod handler;
pub mod health;
pub mod registry;
pub mod rotation;
pub mod server;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use handler::ProxyHandler;
pub use health::HealthProber;
pub use registry::{UpstreamRecord, UpstreamRegistry};
pub use rotation::{create_selector, Algorithm, SharedSelector, UpstreamSelector};
pub use server::ProxyServer;
pub use transport::Socks5Transport;
