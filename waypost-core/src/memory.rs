//! In-memory datagram network.
//!
//! Every [`MemorySocket`] is a mailbox keyed by its bound address inside a
//! shared [`MemoryNetwork`]. Datagrams to unbound addresses vanish, exactly
//! like UDP. Any IP can be bound, which lets tests place a sender on
//! loopback, on a private subnet or on a public address.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    DatagramSocket, ManualTimeProvider, NetworkProvider, Providers, SeededRandomProvider,
};

type Datagram = (Vec<u8>, SocketAddr);

/// First port handed out for `bind(…:0)`.
const EPHEMERAL_PORT_START: u16 = 49152;

#[derive(Debug)]
struct NetworkState {
    mailboxes: HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    next_ephemeral_port: u16,
    delivered: u64,
    lost: u64,
}

/// Shared in-memory network. Clones refer to the same network.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                mailboxes: HashMap::new(),
                next_ephemeral_port: EPHEMERAL_PORT_START,
                delivered: 0,
                lost: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of datagrams that reached a bound socket.
    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }

    /// Number of datagrams addressed to nobody.
    pub fn lost(&self) -> u64 {
        self.lock().lost
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, buf: &[u8]) {
        let mut state = self.lock();
        let delivered = state
            .mailboxes
            .get(&to)
            .is_some_and(|mailbox| mailbox.send((buf.to_vec(), from)).is_ok());
        if delivered {
            state.delivered += 1;
        } else {
            state.lost += 1;
        }
    }

    fn release(&self, addr: SocketAddr) {
        self.lock().mailboxes.remove(&addr);
    }
}

#[async_trait]
impl NetworkProvider for MemoryNetwork {
    type Socket = MemorySocket;

    async fn bind(&self, addr: SocketAddr) -> io::Result<Self::Socket> {
        let mut state = self.lock();
        let mut addr = addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        if addr.port() == 0 {
            addr.set_port(state.next_ephemeral_port);
            state.next_ephemeral_port = state.next_ephemeral_port.wrapping_add(1);
        }
        if state.mailboxes.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.mailboxes.insert(addr, tx);
        Ok(MemorySocket {
            addr,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        })
    }

    async fn resolve(&self, host: &str) -> io::Result<SocketAddr> {
        host.parse::<SocketAddr>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

/// Socket bound on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl MemorySocket {
    /// Pop a queued datagram without waiting.
    ///
    /// Returns `None` when nothing is queued (or another task holds the inbox).
    pub fn try_recv_from(&self) -> Option<Datagram> {
        self.inbox.try_lock().ok()?.try_recv().ok()
    }

    /// Drain every queued datagram.
    pub fn drain(&self) -> Vec<Datagram> {
        std::iter::from_fn(|| self.try_recv_from()).collect()
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.network.release(self.addr);
    }
}

#[async_trait]
impl DatagramSocket for MemorySocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.network.deliver(self.addr, target, buf);
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        let (datagram, from) = inbox
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "network dropped"))?;
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// Providers bundle for tests: in-memory network, manual clock, seeded RNG.
#[derive(Clone, Debug)]
pub struct MemoryProviders {
    network: MemoryNetwork,
    time: ManualTimeProvider,
    random: SeededRandomProvider,
}

impl MemoryProviders {
    /// Create a bundle on `network` with a fresh clock and the given seed.
    pub fn new(network: MemoryNetwork, seed: u64) -> Self {
        Self {
            network,
            time: ManualTimeProvider::new(),
            random: SeededRandomProvider::new(seed),
        }
    }

    /// Share `time` with another bundle.
    pub fn with_clock(mut self, time: ManualTimeProvider) -> Self {
        self.time = time;
        self
    }
}

impl Providers for MemoryProviders {
    type Network = MemoryNetwork;
    type Time = ManualTimeProvider;
    type Random = SeededRandomProvider;

    fn network(&self) -> &Self::Network {
        &self.network
    }

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn random(&self) -> &Self::Random {
        &self.random
    }
}
