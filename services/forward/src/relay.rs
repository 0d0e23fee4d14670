//! Plain full-duplex relay.
//!
//! Both directions run concurrently inside one future. The relay ends
//! when the first direction reaches EOF or fails; both write halves are
//! then shut down so the peers observe the close.
//!
//! Datagram transports have no EOF: a zero-length read is an empty
//! datagram and is forwarded like any other.

use std::io;

use hopline_chain::Transport;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Copy buffer for stream transports.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Copy buffer for datagram transports; one read carries one datagram.
pub const DATAGRAM_BUFFER_SIZE: usize = 65535;

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    /// Client to target.
    pub upstream: u64,
    /// Target to client.
    pub downstream: u64,
}

/// Copy `reader` into `writer` until EOF, counting bytes into `copied`.
///
/// Each chunk is flushed before the next read so datagram and
/// interactive traffic is not held back.
pub async fn copy_buffer<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}

/// Copy datagrams from `reader` to `writer` until an I/O error.
///
/// Each read is sent as exactly one write, empty datagrams included.
pub async fn copy_datagrams<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    loop {
        let n = reader.read(buf).await?;
        let sent = writer.write(&buf[..n]).await?;
        *copied += sent as u64;
    }
}

/// Relay between `client` and `target` until either side finishes.
///
/// EOF in either direction is a normal end for streams. The first I/O
/// error ends the relay and is returned.
pub async fn transport<A, B>(client: A, target: B, kind: Transport) -> io::Result<Traffic>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let buffer_size = match kind {
        Transport::Stream => DEFAULT_BUFFER_SIZE,
        Transport::Datagram => DATAGRAM_BUFFER_SIZE,
    };
    let (mut client_rd, mut client_wr) = split(client);
    let (mut target_rd, mut target_wr) = split(target);
    let mut up_buf = vec![0u8; buffer_size];
    let mut down_buf = vec![0u8; buffer_size];
    let mut traffic = Traffic::default();

    let (direction, result) = match kind {
        Transport::Stream => tokio::select! {
            r = copy_buffer(&mut client_rd, &mut target_wr, &mut up_buf, &mut traffic.upstream) => ("upstream", r),
            r = copy_buffer(&mut target_rd, &mut client_wr, &mut down_buf, &mut traffic.downstream) => ("downstream", r),
        },
        Transport::Datagram => tokio::select! {
            r = copy_datagrams(&mut client_rd, &mut target_wr, &mut up_buf, &mut traffic.upstream) => ("upstream", r),
            r = copy_datagrams(&mut target_rd, &mut client_wr, &mut down_buf, &mut traffic.downstream) => ("downstream", r),
        },
    };
    trace!(direction, ok = result.is_ok(), "Relay direction finished");

    let _ = target_wr.shutdown().await;
    let _ = client_wr.shutdown().await;

    result.map(|()| traffic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopline_chain::UdpSession;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_copies_both_directions() {
        let (client, mut client_peer) = duplex(1024);
        let (target, mut target_peer) = duplex(1024);

        let relay = tokio::spawn(transport(client, target, Transport::Stream));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client_peer);
        let traffic = relay.await.unwrap().unwrap();
        assert_eq!(
            traffic,
            Traffic {
                upstream: 4,
                downstream: 5
            }
        );
    }

    #[tokio::test]
    async fn test_eof_closes_other_side() {
        let (client, client_peer) = duplex(1024);
        let (target, mut target_peer) = duplex(1024);

        let relay = tokio::spawn(transport(client, target, Transport::Stream));
        drop(client_peer);

        relay.await.unwrap().unwrap();
        let mut out = Vec::new();
        target_peer.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_empty_datagram_does_not_end_relay() {
        let client_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSession::connect(client_peer.local_addr().unwrap())
            .await
            .unwrap();
        let target = UdpSession::connect(target_peer.local_addr().unwrap())
            .await
            .unwrap();
        client_peer
            .connect(client.get_ref().local_addr().unwrap())
            .await
            .unwrap();
        target_peer
            .connect(target.get_ref().local_addr().unwrap())
            .await
            .unwrap();

        let relay = tokio::spawn(transport(client, target, Transport::Datagram));

        client_peer.send(b"").await.unwrap();
        client_peer.send(b"after").await.unwrap();

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), target_peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        let n = timeout(Duration::from_secs(2), target_peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"after");

        target_peer.send(b"back").await.unwrap();
        let n = timeout(Duration::from_secs(2), client_peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"back");

        assert!(!relay.is_finished());
        relay.abort();
    }

    #[tokio::test]
    async fn test_write_error_is_returned() {
        let (client, mut client_peer) = duplex(1024);
        let target = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();

        let relay = tokio::spawn(transport(client, target, Transport::Stream));
        client_peer.write_all(b"data").await.unwrap();

        let err = relay.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
