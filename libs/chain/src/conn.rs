//! Connection abstraction shared by listeners, handlers and routers.
//!
//! A connection is any duplex byte stream that can report its endpoints.
//! Datagram sessions (a connected UDP socket) implement the same interface,
//! with one read or write carrying exactly one datagram.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

/// Transport-layer network of a connection or dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// Stream transport.
    Tcp,
    /// Datagram transport.
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Framing of the bytes carried by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Ordered byte stream.
    Stream,
    /// Message oriented: one read or write is one datagram.
    Datagram,
}

impl Transport {
    /// Network used to reach a target for a connection of this transport.
    pub fn network(&self) -> Network {
        match self {
            Transport::Stream => Network::Tcp,
            Transport::Datagram => Network::Udp,
        }
    }
}

/// A duplex connection accepted by a listener or opened by a router.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {
    /// Address of the remote end.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Address of the local end.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Whether the connection is stream or datagram oriented.
    fn transport(&self) -> Transport {
        Transport::Stream
    }

    /// Literal destination carried in the connection metadata, if any.
    ///
    /// Redirecting listeners record the original destination here; a
    /// handler without a routing chain forwards to it.
    fn destination(&self) -> Option<&str> {
        None
    }
}

/// Owned, type-erased connection.
pub type BoxConnection = Box<dyn Connection>;

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        (**self).peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }

    fn transport(&self) -> Transport {
        (**self).transport()
    }

    fn destination(&self) -> Option<&str> {
        (**self).destination()
    }
}

impl Connection for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

/// A connected UDP socket exposed as a datagram connection.
///
/// Reads deliver one datagram each; a datagram larger than the read buffer
/// is truncated. Writes send the whole buffer as one datagram.
#[derive(Debug)]
pub struct UdpSession {
    socket: UdpSocket,
}

impl UdpSession {
    /// Wrap a socket that has already been connected to its peer.
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    /// Bind an ephemeral local socket and connect it to `addr`.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let bind: SocketAddr = if addr.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        Ok(Self { socket })
    }

    pub fn get_ref(&self) -> &UdpSocket {
        &self.socket
    }
}

impl AsyncRead for UdpSession {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpSession {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Connection for UdpSession {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn transport(&self) -> Transport {
        Transport::Datagram
    }
}

/// Attaches a literal destination address to a connection.
#[derive(Debug)]
pub struct WithDestination<C> {
    inner: C,
    destination: String,
}

impl<C> WithDestination<C> {
    pub fn new(inner: C, destination: impl Into<String>) -> Self {
        Self {
            inner,
            destination: destination.into(),
        }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for WithDestination<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for WithDestination<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<C: Connection> Connection for WithDestination<C> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn transport(&self) -> Transport {
        self.inner.transport()
    }

    fn destination(&self) -> Option<&str> {
        Some(&self.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_network_display() {
        assert_eq!(Network::Tcp.to_string(), "tcp");
        assert_eq!(Network::Udp.to_string(), "udp");
        assert_eq!(Transport::Datagram.network(), Network::Udp);
    }

    #[tokio::test]
    async fn test_udp_session_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut session = UdpSession::connect(server_addr).await.unwrap();
        assert_eq!(session.transport(), Transport::Datagram);

        session.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server.send_to(b"pong", from).await.unwrap();
        let n = session.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn test_with_destination_boxed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();

        let conn: BoxConnection = Box::new(WithDestination::new(client, "10.0.0.1:80"));
        assert_eq!(conn.destination(), Some("10.0.0.1:80"));
        assert_eq!(conn.transport(), Transport::Stream);
        assert_eq!(conn.peer_addr().unwrap(), addr);
    }
}
