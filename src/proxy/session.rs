//! Pooled upstream HTTP sessions
//!
//! A session is a hyper HTTP/1 client handle whose transport is a TCP stream
//! already tunneled through one upstream's SOCKS5 endpoint to a specific
//! origin. Sessions are returned to the pool after a transaction and reused
//! for later requests to the same origin through the same upstream.

use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http1::SendRequest;
use parking_lot::Mutex;

/// Pooled sessions kept per upstream; excess check-ins are dropped, which
/// closes the underlying connection
pub const MAX_POOLED_SESSIONS: usize = 5;

struct PooledSession {
    host: String,
    port: u16,
    sender: SendRequest<Full<Bytes>>,
}

/// Thread-safe check-out / check-in pool of upstream sessions
#[derive(Default)]
pub struct SessionPool {
    slots: Mutex<Vec<PooledSession>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Take an idle session for the given origin, if one is pooled
    pub fn check_out(&self, host: &str, port: u16) -> Option<SendRequest<Full<Bytes>>> {
        let mut slots = self.slots.lock();
        // Drop sessions whose connection has gone away in the meantime
        slots.retain(|s| !s.sender.is_closed());
        let idx = slots
            .iter()
            .position(|s| s.host == host && s.port == port && s.sender.is_ready())?;
        Some(slots.swap_remove(idx).sender)
    }

    /// Return a session after use; unusable or surplus sessions are closed
    pub fn check_in(&self, host: &str, port: u16, sender: SendRequest<Full<Bytes>>) {
        if sender.is_closed() || !sender.is_ready() {
            return;
        }
        let mut slots = self.slots.lock();
        if slots.len() < MAX_POOLED_SESSIONS {
            slots.push(PooledSession {
                host: host.to_string(),
                port,
                sender,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper_util::rt::TokioIo;

    async fn make_session() -> SendRequest<Full<Bytes>> {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(client_io))
            .await
            .unwrap();
        tokio::spawn(async move {
            let _ = conn.await;
        });
        // keep the far end alive for the duration of the test
        tokio::spawn(async move {
            let _server_io = server_io;
            std::future::pending::<()>().await;
        });
        sender
    }

    #[tokio::test]
    async fn test_check_out_empty_pool() {
        let pool = SessionPool::new();
        assert!(pool.check_out("example.com", 80).is_none());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_check_in_and_out_same_origin() {
        let pool = SessionPool::new();
        let sender = make_session().await;
        pool.check_in("example.com", 80, sender);
        assert_eq!(pool.len(), 1);

        assert!(pool.check_out("example.com", 80).is_some());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_check_out_requires_matching_origin() {
        let pool = SessionPool::new();
        pool.check_in("example.com", 80, make_session().await);

        assert!(pool.check_out("example.com", 8080).is_none());
        assert!(pool.check_out("other.example", 80).is_none());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_bounded() {
        let pool = SessionPool::new();
        for _ in 0..(MAX_POOLED_SESSIONS + 3) {
            pool.check_in("example.com", 80, make_session().await);
        }
        assert_eq!(pool.len(), MAX_POOLED_SESSIONS);
    }
}
