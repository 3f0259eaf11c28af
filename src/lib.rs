//! Spool - SOCKS5 Upstream Pool Balancer
//!
//! An HTTP/HTTPS forward proxy that multiplexes client traffic across a pool
//! of SOCKS5 upstream proxies.
//!
//! ## Features
//!
//! - Per-upstream lifecycle (available / unavailable / resting) with health
//!   probing and exponential overload backoff
//! - Round-robin and random selection policies
//! - Automatic failover on 429 responses
//! - CONNECT tunneling for HTTPS
//! - Session pooling per upstream
//! - JSON configuration with hot reload

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;

pub use config::Config;
pub use error::{Result, SpoolError};
