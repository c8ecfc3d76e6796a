//! ICE rendezvous: candidate peers announced by an ICE server, hole-punching
//! pings, and promotion to a pinned path.
//!
//! A candidate starts `Connecting`. Each ping sweep sends an unverified
//! [`IcePing`] to both its local and public sockets and counts one attempt.
//! The first [`IcePingReply`] from either socket promotes it to `Connected`
//! and pins that socket. A candidate that used up its attempts is forgotten;
//! it comes back only if the ICE server announces it again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;
use waypost_core::Providers;

use crate::error::NodeListError;
use crate::node_list::LimitedNodeList;
use crate::protocol::{
    IcePeerDescriptor, IcePing, IcePingReply, IceServerHeartbeat, IceServerHeartbeatResponse,
};

/// Attempts before a connecting candidate is dropped.
pub const MAX_ICE_CONNECTION_ATTEMPTS: u32 = 5;

/// Interval between two heartbeats to the ICE server.
pub const ICE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Interval between two ping sweeps.
pub const ICE_PING_INTERVAL: Duration = Duration::from_millis(250);

/// Connection state of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Being pinged.
    Connecting,
    /// Answered; the pinned socket is the path.
    Connected,
}

/// A peer candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPeer {
    uuid: Uuid,
    public_socket: Option<SocketAddr>,
    local_socket: Option<SocketAddr>,
    connection_attempts: u32,
    state: PeerState,
    active_socket: Option<SocketAddr>,
}

impl NetworkPeer {
    fn new(descriptor: &IcePeerDescriptor) -> Self {
        Self {
            uuid: descriptor.uuid,
            public_socket: descriptor.public_socket,
            local_socket: descriptor.local_socket,
            connection_attempts: 0,
            state: PeerState::Connecting,
            active_socket: None,
        }
    }

    /// Peer identity.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Public socket.
    pub fn public_socket(&self) -> Option<SocketAddr> {
        self.public_socket
    }

    /// Local socket.
    pub fn local_socket(&self) -> Option<SocketAddr> {
        self.local_socket
    }

    /// Pings sent so far.
    pub fn connection_attempts(&self) -> u32 {
        self.connection_attempts
    }

    /// Current state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Pinned socket, once connected.
    pub fn active_socket(&self) -> Option<SocketAddr> {
        self.active_socket
    }
}

/// Candidate table.
#[derive(Debug, Clone)]
pub struct IcePeers {
    peers: HashMap<Uuid, NetworkPeer>,
    max_attempts: u32,
}

impl Default for IcePeers {
    fn default() -> Self {
        Self::new(MAX_ICE_CONNECTION_ATTEMPTS)
    }
}

impl IcePeers {
    /// Empty table dropping candidates after `max_attempts` unanswered sweeps.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            peers: HashMap::new(),
            max_attempts,
        }
    }

    /// Add an unseen candidate. Known ones are left untouched.
    pub fn add_candidate(&mut self, descriptor: &IcePeerDescriptor) -> bool {
        if self.peers.contains_key(&descriptor.uuid) {
            return false;
        }
        debug!(uuid = %descriptor.uuid, "new ICE candidate");
        self.peers.insert(descriptor.uuid, NetworkPeer::new(descriptor));
        true
    }

    /// Ingest an ICE server heartbeat response; returns how many were new.
    pub fn handle_heartbeat_response(&mut self, response: &IceServerHeartbeatResponse) -> usize {
        response
            .peers
            .iter()
            .filter(|descriptor| self.add_candidate(descriptor))
            .count()
    }

    /// One sweep over connecting candidates.
    ///
    /// Drops candidates that used up their attempts and returns the sockets
    /// to ping for the rest, counting one attempt each.
    pub fn ping_sweep(&mut self) -> Vec<(Uuid, SocketAddr)> {
        let max_attempts = self.max_attempts;
        self.peers.retain(|uuid, peer| {
            let exhausted =
                peer.state == PeerState::Connecting && peer.connection_attempts >= max_attempts;
            if exhausted {
                debug!(
                    %uuid,
                    attempts = peer.connection_attempts,
                    "dropping unreachable ICE candidate"
                );
            }
            !exhausted
        });

        let mut targets = Vec::new();
        for peer in self.peers.values_mut().filter(|p| p.state == PeerState::Connecting) {
            targets.extend(peer.local_socket.map(|socket| (peer.uuid, socket)));
            targets.extend(
                peer.public_socket
                    .filter(|public| Some(*public) != peer.local_socket)
                    .map(|socket| (peer.uuid, socket)),
            );
            peer.connection_attempts += 1;
        }
        targets
    }

    /// A ping reply from `from` claiming to be `uuid`.
    ///
    /// The first reply from one of the candidate's own sockets connects it
    /// and pins that socket, which is returned. Later replies change nothing.
    pub fn handle_ping_reply(&mut self, uuid: &Uuid, from: SocketAddr) -> Option<SocketAddr> {
        let peer = self.peers.get_mut(uuid)?;
        if peer.state == PeerState::Connected {
            return None;
        }
        if Some(from) != peer.local_socket && Some(from) != peer.public_socket {
            debug!(%uuid, %from, "ICE ping reply from unknown socket");
            return None;
        }
        let path = if Some(from) == peer.local_socket { "local" } else { "public" };
        info!(%uuid, %from, path, "ICE peer connected");
        peer.state = PeerState::Connected;
        peer.active_socket = Some(from);
        Some(from)
    }

    /// A candidate in any state.
    pub fn peer(&self, uuid: &Uuid) -> Option<&NetworkPeer> {
        self.peers.get(uuid)
    }

    /// A connected candidate.
    pub fn connected_peer(&self, uuid: &Uuid) -> Option<&NetworkPeer> {
        self.peers
            .get(uuid)
            .filter(|peer| peer.state == PeerState::Connected)
    }

    /// Forget a candidate.
    pub fn remove(&mut self, uuid: &Uuid) -> Option<NetworkPeer> {
        self.peers.remove(uuid)
    }
}

impl<P: Providers> LimitedNodeList<P> {
    /// Announce our sockets to the ICE server.
    pub async fn send_ice_heartbeat(
        &self,
        ice_server: SocketAddr,
        connection_request_id: Option<Uuid>,
    ) -> Result<(), NodeListError> {
        let heartbeat = IceServerHeartbeat {
            sender_uuid: self.session_uuid(),
            public_socket: self.public_socket(),
            local_socket: self.local_addr().ok(),
            connection_request_id,
        };
        self.write_unverified_datagram(&heartbeat, ice_server).await?;
        Ok(())
    }

    /// Run one ping sweep and send the pings.
    pub async fn ping_ice_peers(&self, peers: &mut IcePeers) -> Result<usize, NodeListError> {
        let ping = IcePing {
            sender_uuid: self.session_uuid(),
        };
        let targets = peers.ping_sweep();
        for (_, socket) in &targets {
            self.write_unverified_datagram(&ping, *socket).await?;
        }
        Ok(targets.len())
    }

    /// Answer an ICE ping on the socket it came from.
    pub async fn answer_ice_ping(&self, from: SocketAddr) -> Result<(), NodeListError> {
        let reply = IcePingReply {
            sender_uuid: self.session_uuid(),
        };
        self.write_unverified_datagram(&reply, from).await?;
        Ok(())
    }
}
