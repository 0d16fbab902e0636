//! CONNECT tunnel relay
//!
//! Moves opaque bytes between the hijacked client connection and the origin
//! connection until both directions are done.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::proxy::session::SessionLog;
use crate::proxy::transport::ProxyConnection;

/// Literal acknowledgment written once the origin is reachable
pub const CONNECT_ACK: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Lifecycle of a CONNECT session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Start,
    PreconditionChecked,
    Hijacked,
    Dialed,
    AckSent,
    Relaying,
    Closed,
    Aborted,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Start => "START",
            TunnelState::PreconditionChecked => "PRECONDITION_CHECKED",
            TunnelState::Hijacked => "HIJACKED",
            TunnelState::Dialed => "DIALED",
            TunnelState::AckSent => "ACK_SENT",
            TunnelState::Relaying => "RELAYING",
            TunnelState::Closed => "CLOSED",
            TunnelState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Result of one finished copy direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferOutcome {
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Both directions of a finished tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSummary {
    pub target: String,
    pub elapsed: Duration,
    /// Client to origin
    pub upstream: TransferOutcome,
    /// Origin to client
    pub downstream: TransferOutcome,
}

/// Write the acknowledgment straight onto the raw client connection
pub async fn write_ack<C>(client: &mut C) -> io::Result<()>
where
    C: AsyncWrite + Unpin + ?Sized,
{
    client.write_all(CONNECT_ACK).await?;
    client.flush().await
}

/// Relay between `client` and `origin` on two spawned tasks
///
/// Returns only after both directions reached end-of-stream or failed; both
/// connections are closed by then. A failing direction logs its own error
/// and leaves the other one running.
#[instrument(skip_all, fields(session = %log.tag().id))]
pub async fn relay(
    client: Box<dyn ProxyConnection>,
    origin: Box<dyn ProxyConnection>,
    log: &SessionLog,
) -> (TransferOutcome, TransferOutcome) {
    let (client_read, client_write) = tokio::io::split(client);
    let (origin_read, origin_write) = tokio::io::split(origin);

    let upstream = tokio::spawn(copy_direction(client_read, origin_write, log.clone()));
    let downstream = tokio::spawn(copy_direction(origin_read, client_write, log.clone()));

    let (upstream, downstream) = tokio::join!(upstream, downstream);

    let upstream = upstream.unwrap_or_else(|e| {
        log.error(format_args!("Copy task failed: {}", e));
        TransferOutcome::default()
    });
    let downstream = downstream.unwrap_or_else(|e| {
        log.error(format_args!("Copy task failed: {}", e));
        TransferOutcome::default()
    });

    debug!(
        bytes_sent = upstream.bytes,
        bytes_received = downstream.bytes,
        "Tunnel closed"
    );

    (upstream, downstream)
}

/// Copy until end-of-stream or error, then half-close the destination
///
/// The halves are dropped when this returns; the underlying connection
/// closes once the opposite direction has dropped its halves too.
async fn copy_direction<R, W>(mut reader: R, mut writer: W, log: SessionLog) -> TransferOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let start = Instant::now();
    let (bytes, result) = copy_counted(&mut reader, &mut writer).await;

    if let Err(e) = result {
        log.error(format_args!("Copy: {}", e));
    }

    // Propagate EOF so the peer can finish its own direction
    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown after copy failed: {}", e);
    }

    TransferOutcome {
        bytes,
        elapsed: start.elapsed(),
    }
}

/// Like `tokio::io::copy`, but reports the bytes moved even when it fails
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (total, Err(e)),
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            return (total, Err(e));
        }
        total += n as u64;
    }

    (total, writer.flush().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::session::SessionTag;
    use crate::proxy::testing::RecordingLogger;
    use std::sync::Arc;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn session_log(logger: Arc<RecordingLogger>) -> SessionLog {
        SessionLog::new(
            SessionTag {
                id: Uuid::new_v4(),
                peer: None,
            },
            logger,
        )
    }

    #[test]
    fn test_tunnel_state_names() {
        assert_eq!(TunnelState::PreconditionChecked.to_string(), "PRECONDITION_CHECKED");
        assert_eq!(TunnelState::AckSent.to_string(), "ACK_SENT");
    }

    #[tokio::test]
    async fn test_write_ack_is_byte_exact() {
        let (mut proxy_side, mut client) = tokio::io::duplex(64);
        write_ack(&mut proxy_side).await.unwrap();
        drop(proxy_side);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"HTTP/1.1 200 OK\r\n\r\n");
    }

    #[tokio::test]
    async fn test_relay_copies_both_ways() {
        let logger = Arc::new(RecordingLogger::default());
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (origin, mut origin_peer) = tokio::io::duplex(1024);

        let log = session_log(logger.clone());
        let handle = tokio::spawn(async move {
            relay(Box::new(client), Box::new(origin), &log).await
        });

        client_peer.write_all(b"hello from client").await.unwrap();
        client_peer.shutdown().await.unwrap();

        origin_peer.write_all(b"hello from origin").await.unwrap();
        origin_peer.shutdown().await.unwrap();

        let mut upstream = Vec::new();
        origin_peer.read_to_end(&mut upstream).await.unwrap();
        assert_eq!(upstream, b"hello from client");

        let mut downstream = Vec::new();
        client_peer.read_to_end(&mut downstream).await.unwrap();
        assert_eq!(downstream, b"hello from origin");

        let (up, down) = timeout(Duration::from_secs(1), handle)
            .await
            .expect("relay timed out")
            .unwrap();
        assert_eq!(up.bytes, 17);
        assert_eq!(down.bytes, 17);
        assert!(logger.errors().is_empty());
    }

    #[tokio::test]
    async fn test_relay_waits_for_slow_direction() {
        let logger = Arc::new(RecordingLogger::default());
        let (client, mut client_peer) = tokio::io::duplex(64 * 1024);
        let (origin, mut origin_peer) = tokio::io::duplex(64 * 1024);

        let log = session_log(logger.clone());
        let handle = tokio::spawn(async move {
            relay(Box::new(client), Box::new(origin), &log).await
        });

        // Client side finishes immediately
        client_peer.write_all(b"quick").await.unwrap();
        client_peer.shutdown().await.unwrap();

        // Origin reads what arrived, then answers long after the client is done
        let mut upstream = Vec::new();
        origin_peer.read_to_end(&mut upstream).await.unwrap();
        assert_eq!(upstream, b"quick");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        let payload = vec![7u8; 20_000];
        origin_peer.write_all(&payload).await.unwrap();
        origin_peer.shutdown().await.unwrap();

        let mut downstream = Vec::new();
        client_peer.read_to_end(&mut downstream).await.unwrap();
        assert_eq!(downstream, payload);

        let (up, down) = timeout(Duration::from_secs(1), handle)
            .await
            .expect("relay timed out")
            .unwrap();
        assert_eq!(up.bytes, 5);
        assert_eq!(down.bytes, 20_000);
    }

    #[tokio::test]
    async fn test_relay_logs_failed_direction_independently() {
        let logger = Arc::new(RecordingLogger::default());
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (origin, origin_peer) = tokio::io::duplex(1024);

        // The origin vanishes: writes towards it fail, reads from it see EOF
        drop(origin_peer);

        let log = session_log(logger.clone());
        let handle = tokio::spawn(async move {
            relay(Box::new(client), Box::new(origin), &log).await
        });

        client_peer.write_all(b"lost").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut downstream = Vec::new();
        client_peer.read_to_end(&mut downstream).await.unwrap();
        assert!(downstream.is_empty());

        let (up, down) = timeout(Duration::from_secs(1), handle)
            .await
            .expect("relay timed out")
            .unwrap();
        assert_eq!(up.bytes, 0);
        assert_eq!(down.bytes, 0);

        let errors = logger.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Copy: "));
    }
}
