//! Byte relays between client and upstream

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ConnectionTap, Direction};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Relay both directions while copying every chunk into the tap.
///
/// Each direction runs independently; a half-close on one side is forwarded
/// as a write shutdown on the other. The tap is closed once both directions
/// have finished.
pub async fn relay_with_tap<C, U>(client: C, upstream: U, tap: ConnectionTap) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let (client_to_upstream, upstream_to_client) = tokio::join!(
        copy_tee(&mut client_read, &mut upstream_write, &tap, Direction::Request),
        copy_tee(&mut upstream_read, &mut client_write, &tap, Direction::Response),
    );

    tap.close().await;

    RelayStats {
        client_to_upstream,
        upstream_to_client,
    }
}

async fn copy_tee<R, W>(reader: &mut R, writer: &mut W, tap: &ConnectionTap, direction: Direction) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(connection = %tap.connection(), ?direction, "Relay read ended: {e}");
                break;
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            tracing::debug!(connection = %tap.connection(), ?direction, "Relay write ended: {e}");
            break;
        }
        total += n as u64;

        tap.record(direction, Bytes::copy_from_slice(&buf[..n])).await;
    }

    let _ = writer.shutdown().await;
    total
}

/// Transparent tunnel without capture
pub async fn tunnel<C, U>(mut client: C, mut upstream: U) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((client_to_upstream, upstream_to_client)) => RelayStats {
            client_to_upstream,
            upstream_to_client,
        },
        Err(e) => {
            tracing::debug!("Tunnel ended: {e}");
            RelayStats::default()
        }
    }
}
