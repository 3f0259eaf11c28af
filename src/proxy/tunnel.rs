//! CONNECT tunnel implementation
//!
//! Bidirectional byte splice between the client and an upstream-tunneled
//! stream. The outcome distinguishes which side went away so the forwarder
//! can hold upstream faults against the upstream without punishing it for
//! client disconnects.

use futures::future::{select, Either};
use futures::pin_mut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const COPY_BUF_SIZE: usize = 8192;

/// Terminal state of a tunnel
#[derive(Debug)]
pub enum TunnelOutcome {
    /// Both directions reached end of stream
    Closed {
        client_to_upstream: u64,
        upstream_to_client: u64,
    },
    /// The upstream side failed mid-stream
    UpstreamError(std::io::Error),
    /// The client went away mid-stream
    ClientAbort,
}

enum HalfResult {
    /// Clean EOF after relaying this many bytes
    Eof(u64),
    ClientSide,
    UpstreamSide(std::io::Error),
}

/// Splice bytes between client and upstream until either side closes
///
/// A clean half-close propagates a shutdown to the peer and keeps the other
/// direction running; an error tears the whole tunnel down.
pub async fn splice<C, U>(client: C, upstream: U) -> TunnelOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let mut buf = [0u8; COPY_BUF_SIZE];
        let mut total = 0u64;
        loop {
            let n = match client_read.read(&mut buf).await {
                Ok(0) => {
                    let _ = upstream_write.shutdown().await;
                    return HalfResult::Eof(total);
                }
                Ok(n) => n,
                Err(_) => return HalfResult::ClientSide,
            };
            if let Err(e) = upstream_write.write_all(&buf[..n]).await {
                return HalfResult::UpstreamSide(e);
            }
            total += n as u64;
        }
    };

    let upstream_to_client = async {
        let mut buf = [0u8; COPY_BUF_SIZE];
        let mut total = 0u64;
        loop {
            let n = match upstream_read.read(&mut buf).await {
                Ok(0) => {
                    let _ = client_write.shutdown().await;
                    return HalfResult::Eof(total);
                }
                Ok(n) => n,
                Err(e) => return HalfResult::UpstreamSide(e),
            };
            if client_write.write_all(&buf[..n]).await.is_err() {
                return HalfResult::ClientSide;
            }
            total += n as u64;
        }
    };

    pin_mut!(client_to_upstream);
    pin_mut!(upstream_to_client);

    let outcome = match select(client_to_upstream, upstream_to_client).await {
        Either::Left((HalfResult::Eof(sent), rest)) => match rest.await {
            HalfResult::Eof(received) => TunnelOutcome::Closed {
                client_to_upstream: sent,
                upstream_to_client: received,
            },
            HalfResult::UpstreamSide(e) => TunnelOutcome::UpstreamError(e),
            HalfResult::ClientSide => TunnelOutcome::ClientAbort,
        },
        Either::Right((HalfResult::Eof(received), rest)) => match rest.await {
            HalfResult::Eof(sent) => TunnelOutcome::Closed {
                client_to_upstream: sent,
                upstream_to_client: received,
            },
            HalfResult::UpstreamSide(e) => TunnelOutcome::UpstreamError(e),
            HalfResult::ClientSide => TunnelOutcome::ClientAbort,
        },
        // an errored direction cancels the other; both sockets drop with the
        // caller
        Either::Left((HalfResult::UpstreamSide(e), _))
        | Either::Right((HalfResult::UpstreamSide(e), _)) => TunnelOutcome::UpstreamError(e),
        Either::Left((HalfResult::ClientSide, _)) | Either::Right((HalfResult::ClientSide, _)) => {
            TunnelOutcome::ClientAbort
        }
    };

    if let TunnelOutcome::Closed {
        client_to_upstream,
        upstream_to_client,
    } = &outcome
    {
        debug!(
            bytes_sent = client_to_upstream,
            bytes_received = upstream_to_client,
            "Tunnel closed"
        );
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_splice_clean_close() {
        let (client, mut client_far) = tokio::io::duplex(1024);
        let (upstream, mut upstream_far) = tokio::io::duplex(1024);

        let splice_handle = tokio::spawn(async move { splice(client, upstream).await });

        client_far.write_all(b"hello from client").await.unwrap();
        client_far.shutdown().await.unwrap();

        upstream_far.write_all(b"hello from server").await.unwrap();
        upstream_far.shutdown().await.unwrap();

        let mut buf = vec![0u8; 100];
        let n = upstream_far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from client");

        let mut buf = vec![0u8; 100];
        let n = client_far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from server");

        let outcome = tokio::time::timeout(Duration::from_secs(1), splice_handle)
            .await
            .expect("splice timed out")
            .unwrap();
        match outcome {
            TunnelOutcome::Closed {
                client_to_upstream,
                upstream_to_client,
            } => {
                assert_eq!(client_to_upstream, 17);
                assert_eq!(upstream_to_client, 17);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_splice_is_byte_transparent() {
        let (client, mut client_far) = tokio::io::duplex(64);
        let (upstream, mut upstream_far) = tokio::io::duplex(64);

        let splice_handle = tokio::spawn(async move { splice(client, upstream).await });

        // push more than one buffer's worth in each direction
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client_far.write_all(&payload).await.unwrap();
            client_far.shutdown().await.unwrap();
            client_far
        });

        let mut received = Vec::new();
        upstream_far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let mut client_far = writer.await.unwrap();
        upstream_far.shutdown().await.unwrap();
        let mut tail = Vec::new();
        client_far.read_to_end(&mut tail).await.unwrap();
        assert!(tail.is_empty());

        let outcome = tokio::time::timeout(Duration::from_secs(1), splice_handle)
            .await
            .expect("splice timed out")
            .unwrap();
        assert!(matches!(outcome, TunnelOutcome::Closed { .. }));
    }

    #[tokio::test]
    async fn test_splice_half_close_keeps_other_direction() {
        let (client, mut client_far) = tokio::io::duplex(1024);
        let (upstream, mut upstream_far) = tokio::io::duplex(1024);

        let splice_handle = tokio::spawn(async move { splice(client, upstream).await });

        // client finishes sending immediately
        client_far.shutdown().await.unwrap();

        // upstream can still deliver afterwards
        upstream_far.write_all(b"late data").await.unwrap();
        upstream_far.shutdown().await.unwrap();

        let mut buf = Vec::new();
        client_far.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"late data");

        let outcome = tokio::time::timeout(Duration::from_secs(1), splice_handle)
            .await
            .expect("splice timed out")
            .unwrap();
        assert!(matches!(outcome, TunnelOutcome::Closed { .. }));
    }
}
