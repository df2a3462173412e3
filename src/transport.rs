//! Abstract datagram transport
//!
//! The [`Datagram`] trait lets the host run over any async datagram
//! carrier, not just plain UDP — a relay, an in-memory test harness, or a
//! tunnelled socket. The built-in [`UdpDatagram`] implementation is backed
//! by `tokio::net::UdpSocket`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::net::UdpSocket;

/// Boxed future returned by [`Datagram::send_to`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;

/// Boxed future returned by [`Datagram::recv_from`].
pub type RecvFuture<'a> =
    Pin<Box<dyn Future<Output = io::Result<(usize, SocketAddr)>> + Send + 'a>>;

/// Async datagram carrier used by [`Host`](crate::Host).
///
/// Implementors must provide unreliable, unordered, boundary-preserving
/// send/receive addressed by `SocketAddr`. The trait is object-safe so it
/// can be used as `Arc<dyn Datagram>`.
pub trait Datagram: Send + Sync + 'static {
    /// Send `buf` to `target`, returning the number of bytes written.
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a>;

    /// Receive one datagram into `buf`, returning `(length, source)`.
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a>;

    /// Return the local address this transport is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

// ---------------------------------------------------------------------------
// UdpDatagram — default implementation backed by tokio::net::UdpSocket
// ---------------------------------------------------------------------------

/// Default [`Datagram`] implementation wrapping a `tokio::net::UdpSocket`.
pub struct UdpDatagram {
    socket: UdpSocket,
}

impl UdpDatagram {
    /// Bind a new UDP socket to `addr`.
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    /// Wrap an existing `UdpSocket`.
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl Datagram for UdpDatagram {
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a> {
        Box::pin(self.socket.send_to(buf, target))
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a> {
        Box::pin(self.socket.recv_from(buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
