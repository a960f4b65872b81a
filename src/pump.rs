//! Per-tunnel byte pump: two half-duplex copies between the accepted client
//! socket and the post-Connect mux socket.
//!
//! Each direction reads into its own buffer and writes the chunk out before
//! looking at anything else; the stop signal and the idle timer are only
//! consulted at the read boundary, so a successfully read chunk is always
//! flushed to the peer before the direction shuts down.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tracing::debug;

/// Read/write chunk size. Large enough that small-packet traffic does not
/// dominate syscall overhead.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Why a pump (or one of its directions) stopped.
#[derive(Debug)]
pub enum PumpEnd {
    /// A peer closed its sending side.
    Eof,
    /// No byte was read within the configured idle timeout.
    IdleTimeout,
    /// The peer dropped the connection (ECONNRESET / EPIPE class).
    PeerReset(io::Error),
    /// Any other socket error.
    Error(io::Error),
    /// The opposite direction finished first and this one was told to stop.
    Stopped,
}

impl PumpEnd {
    #[must_use]
    pub fn is_idle_timeout(&self) -> bool {
        matches!(self, PumpEnd::IdleTimeout)
    }
}

/// Pump bytes both ways until either direction ends. Returns the reason the
/// first direction stopped; both underlying streams are closed exactly once
/// (by dropping their halves) by the time this returns.
pub async fn run<C, M>(client: C, mux: M, idle_timeout: Option<Duration>) -> PumpEnd
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    M: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (mux_rd, mux_wr) = tokio::io::split(mux);
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut up = tokio::spawn(copy_half(client_rd, mux_wr, idle_timeout, stop_rx.clone()));
    let mut down = tokio::spawn(copy_half(mux_rd, client_wr, idle_timeout, stop_rx));

    let (first, up_finished) = tokio::select! {
        end = &mut up => (end, true),
        end = &mut down => (end, false),
    };
    let _ = stop_tx.send(true);

    // The opposite direction flushes anything it already read, then exits.
    let second = if up_finished {
        (&mut down).await
    } else {
        (&mut up).await
    };
    if let Ok(end @ (PumpEnd::PeerReset(_) | PumpEnd::Error(_))) = &second {
        debug!(end = ?end, "late pump direction ended with error");
    }

    first.unwrap_or_else(|e| PumpEnd::Error(io::Error::other(e)))
}

async fn copy_half<R, W>(
    mut rd: ReadHalf<R>,
    mut wr: WriteHalf<W>,
    idle_timeout: Option<Duration>,
    mut stop: watch::Receiver<bool>,
) -> PumpEnd
where
    R: AsyncRead + AsyncWrite,
    W: AsyncRead + AsyncWrite,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            read = read_with_idle(&mut rd, &mut buf, idle_timeout) => read,
            _ = stop.changed() => {
                let _ = wr.shutdown().await;
                return PumpEnd::Stopped;
            }
        };

        let n = match read {
            Ok(0) => {
                let _ = wr.shutdown().await;
                return PumpEnd::Eof;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                let _ = wr.shutdown().await;
                return PumpEnd::IdleTimeout;
            }
            Err(e) if is_peer_reset(&e) => return PumpEnd::PeerReset(e),
            Err(e) => return PumpEnd::Error(e),
        };

        if let Err(e) = wr.write_all(&buf[..n]).await {
            if is_peer_reset(&e) {
                return PumpEnd::PeerReset(e);
            }
            return PumpEnd::Error(e);
        }
    }
}

async fn read_with_idle<R>(
    rd: &mut ReadHalf<R>,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncRead + AsyncWrite,
{
    match idle_timeout {
        Some(window) => match tokio::time::timeout(window, rd.read(buf)).await {
            Ok(read) => read,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle tunnel")),
        },
        None => rd.read(buf).await,
    }
}

fn is_peer_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_echo_through_both_directions() {
        let (mut client_peer, client_side) = tokio::io::duplex(4096);
        let (mut mux_peer, mux_side) = tokio::io::duplex(4096);

        let pump = tokio::spawn(run(client_side, mux_side, None));

        client_peer.write_all(b"HELLO\n").await.unwrap();
        let mut forwarded = [0u8; 6];
        mux_peer.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(&forwarded, b"HELLO\n");

        mux_peer.write_all(b"WORLD\n").await.unwrap();
        let mut returned = [0u8; 6];
        client_peer.read_exact(&mut returned).await.unwrap();
        assert_eq!(&returned, b"WORLD\n");

        drop(client_peer);
        let end = pump.await.unwrap();
        assert!(matches!(end, PumpEnd::Eof), "got {:?}", end);
    }

    #[tokio::test]
    async fn test_byte_conservation_large_transfer() {
        let (mut client_peer, client_side) = tokio::io::duplex(16 * 1024);
        let (mut mux_peer, mux_side) = tokio::io::duplex(16 * 1024);

        let pump = tokio::spawn(run(client_side, mux_side, None));

        let sent: Vec<u8> = (0..1_000_000).map(|i| (i % 251) as u8).collect();
        let to_send = sent.clone();
        let writer = tokio::spawn(async move {
            client_peer.write_all(&to_send).await.unwrap();
            client_peer.shutdown().await.unwrap();
            client_peer
        });

        let mut received = Vec::with_capacity(sent.len());
        mux_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), sent.len());
        assert_eq!(received, sent);

        drop(writer.await.unwrap());
        assert!(matches!(pump.await.unwrap(), PumpEnd::Eof));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_fires_when_nothing_flows() {
        let (client_peer, client_side) = tokio::io::duplex(4096);
        let (mux_peer, mux_side) = tokio::io::duplex(4096);

        let end = run(client_side, mux_side, Some(Duration::from_secs(1))).await;
        assert!(end.is_idle_timeout(), "got {:?}", end);

        drop(client_peer);
        drop(mux_peer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_resets_the_idle_window() {
        let (mut client_peer, client_side) = tokio::io::duplex(4096);
        let (mut mux_peer, mux_side) = tokio::io::duplex(4096);

        let pump = tokio::spawn(run(client_side, mux_side, Some(Duration::from_secs(2))));

        // Keep both directions busy for longer than the window. The timeout
        // is per direction, so the return traffic matters too.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            client_peer.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            mux_peer.read_exact(&mut buf).await.unwrap();
            mux_peer.write_all(b"pong").await.unwrap();
            client_peer.read_exact(&mut buf).await.unwrap();
        }

        // Then let it go idle.
        let end = pump.await.unwrap();
        assert!(end.is_idle_timeout(), "got {:?}", end);
    }

    #[tokio::test]
    async fn test_mux_side_close_ends_the_pump() {
        let (mut client_peer, client_side) = tokio::io::duplex(4096);
        let (mux_peer, mux_side) = tokio::io::duplex(4096);

        let pump = tokio::spawn(run(client_side, mux_side, None));
        drop(mux_peer);

        assert!(matches!(pump.await.unwrap(), PumpEnd::Eof));

        // The client side observes the close as EOF.
        let mut buf = [0u8; 1];
        assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
    }
}
