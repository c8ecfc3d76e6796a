//! Network provider abstraction for real and in-memory datagram sockets.
//!
//! The coordinator and the workers only ever speak UDP. Everything that sends
//! or receives a datagram goes through [`DatagramSocket`], which lets the
//! tests replace the kernel with [`MemoryNetwork`](crate::MemoryNetwork).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

/// A bound datagram socket.
///
/// Sockets are `Send + Sync` because the worker process hands its socket from
/// the bootstrap loop to the worker execution context.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Send one datagram to `target`. Delivery is best effort.
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, returning its length and the sender address.
    ///
    /// Must be cancellation safe: it is raced against timers in `select!`.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Address this socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Provider trait for binding sockets and resolving host names.
#[async_trait]
pub trait NetworkProvider: Clone + Send + Sync + 'static {
    /// The socket type produced by [`bind`](Self::bind).
    type Socket: DatagramSocket;

    /// Bind a datagram socket. Port 0 picks an ephemeral port.
    async fn bind(&self, addr: SocketAddr) -> io::Result<Self::Socket>;

    /// Resolve `host:port` to the first matching socket address.
    ///
    /// Resolution must not block the reactor.
    async fn resolve(&self, host: &str) -> io::Result<SocketAddr>;
}

/// Real Tokio networking implementation.
#[derive(Debug, Clone, Default)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create a new Tokio network provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkProvider for TokioNetworkProvider {
    type Socket = TokioUdpSocket;

    async fn bind(&self, addr: SocketAddr) -> io::Result<Self::Socket> {
        let socket = tokio::net::UdpSocket::bind(addr).await?;
        Ok(TokioUdpSocket {
            inner: Arc::new(socket),
        })
    }

    async fn resolve(&self, host: &str) -> io::Result<SocketAddr> {
        if let Ok(addr) = host.parse::<SocketAddr>() {
            return Ok(addr);
        }
        tokio::net::lookup_host(host)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
            })
    }
}

/// Wrapper for a Tokio `UdpSocket` implementing [`DatagramSocket`].
#[derive(Debug, Clone)]
pub struct TokioUdpSocket {
    inner: Arc<tokio::net::UdpSocket>,
}

#[async_trait]
impl DatagramSocket for TokioUdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
