//! Tracked peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;
use waypost_core::NodeType;

/// A peer known to a [`LimitedNodeList`](crate::LimitedNodeList).
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    uuid: Uuid,
    node_type: NodeType,
    public_socket: Option<SocketAddr>,
    local_socket: Option<SocketAddr>,
    pinned_socket: Option<SocketAddr>,
    observed_socket: Option<SocketAddr>,
    connection_secret: Option<Uuid>,
    last_heard: Duration,
    wake_timestamp: Duration,
    linked_data: Option<NodeData>,
}

impl Node {
    /// A node first heard of at `now`.
    pub fn new(
        uuid: Uuid,
        node_type: NodeType,
        public_socket: Option<SocketAddr>,
        local_socket: Option<SocketAddr>,
        now: Duration,
    ) -> Self {
        Self {
            uuid,
            node_type,
            public_socket,
            local_socket,
            pinned_socket: None,
            observed_socket: None,
            connection_secret: None,
            last_heard: now,
            wake_timestamp: now,
            linked_data: None,
        }
    }

    /// Node identity.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Node type.
    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Public socket.
    pub fn public_socket(&self) -> Option<SocketAddr> {
        self.public_socket
    }

    /// Local socket.
    pub fn local_socket(&self) -> Option<SocketAddr> {
        self.local_socket
    }

    /// Replace both advertised sockets.
    ///
    /// A pin that no longer matches either socket is cleared.
    pub fn set_sockets(
        &mut self,
        public_socket: Option<SocketAddr>,
        local_socket: Option<SocketAddr>,
    ) {
        self.public_socket = public_socket;
        self.local_socket = local_socket;
        if let Some(pinned) = self.pinned_socket {
            if Some(pinned) != public_socket && Some(pinned) != local_socket {
                self.pinned_socket = None;
            }
        }
    }

    /// Pin the path used for every send to this node.
    pub fn pin_socket(&mut self, socket: SocketAddr) {
        self.pinned_socket = Some(socket);
    }

    /// The pinned socket, if any.
    pub fn pinned_socket(&self) -> Option<SocketAddr> {
        self.pinned_socket
    }

    /// Record the address a verified datagram came from.
    pub fn set_observed_socket(&mut self, socket: SocketAddr) {
        self.observed_socket = Some(socket);
    }

    /// Where datagrams to this node go.
    ///
    /// The pinned socket wins, then the last observed sender address, then
    /// the advertised public and local sockets.
    pub fn active_socket(&self) -> Option<SocketAddr> {
        self.pinned_socket
            .or(self.observed_socket)
            .or(self.public_socket)
            .or(self.local_socket)
    }

    /// Secret hashing datagrams between us and this node.
    pub fn connection_secret(&self) -> Option<Uuid> {
        self.connection_secret
    }

    /// Set the connection secret.
    pub fn set_connection_secret(&mut self, secret: Uuid) {
        self.connection_secret = Some(secret);
    }

    /// Last time a verified datagram arrived from this node.
    pub fn last_heard(&self) -> Duration {
        self.last_heard
    }

    /// Refresh the last-heard time.
    pub fn touch(&mut self, now: Duration) {
        self.last_heard = now;
    }

    /// When the node was first added.
    pub fn wake_timestamp(&self) -> Duration {
        self.wake_timestamp
    }

    /// Type-specific data attached by the owner of the node list.
    pub fn linked_data(&self) -> Option<&NodeData> {
        self.linked_data.as_ref()
    }

    /// Attach linked data, replacing any previous value.
    pub fn set_linked_data(&mut self, data: NodeData) {
        self.linked_data = Some(data);
    }

    /// Coordinator-side data, if that is what is attached.
    pub fn domain_data(&self) -> Option<&DomainNodeData> {
        match &self.linked_data {
            Some(NodeData::Domain(data)) => Some(data),
            _ => None,
        }
    }

    /// Mutable coordinator-side data.
    pub fn domain_data_mut(&mut self) -> Option<&mut DomainNodeData> {
        match &mut self.linked_data {
            Some(NodeData::Domain(data)) => Some(data),
            _ => None,
        }
    }

    /// Worker-side peer data, if that is what is attached.
    pub fn peer_data(&self) -> Option<&PeerNodeData> {
        match &self.linked_data {
            Some(NodeData::Peer(data)) => Some(data),
            _ => None,
        }
    }

    /// Mutable worker-side peer data.
    pub fn peer_data_mut(&mut self) -> Option<&mut PeerNodeData> {
        match &mut self.linked_data {
            Some(NodeData::Peer(data)) => Some(data),
            _ => None,
        }
    }
}

/// Per-node data, keyed by who owns the node list.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    /// Kept by the coordinator for every admitted node.
    Domain(DomainNodeData),
    /// Kept by a worker for every peer it learned from the coordinator.
    Peer(PeerNodeData),
}

/// Coordinator bookkeeping for an admitted node.
///
/// Other nodes are referenced by UUID only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainNodeData {
    /// Original assignment this node fulfils.
    pub assignment_uuid: Option<Uuid>,
    /// Wallet credited for the work.
    pub wallet_uuid: Option<Uuid>,
    /// Authenticated username.
    pub username: Option<String>,
    /// Node types this node wants in its peer list.
    pub interests: Vec<NodeType>,
    /// Pairwise secrets with other nodes, by peer UUID.
    pub session_secrets: HashMap<Uuid, Uuid>,
}

/// Worker bookkeeping for a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerNodeData {
    /// Pings sent to this peer.
    pub pings_sent: u32,
    /// Round-trip time of the last answered ping.
    pub last_ping_rtt: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().expect("addr")
    }

    #[test]
    fn test_active_socket_precedence() {
        let mut node = Node::new(
            Uuid::from_u128(1),
            NodeType::AudioMixer,
            Some(addr("203.0.113.5:40000")),
            Some(addr("10.0.0.5:40000")),
            Duration::ZERO,
        );
        assert_eq!(node.active_socket(), Some(addr("203.0.113.5:40000")));

        node.set_observed_socket(addr("203.0.113.5:40001"));
        assert_eq!(node.active_socket(), Some(addr("203.0.113.5:40001")));

        node.pin_socket(addr("10.0.0.5:40000"));
        assert_eq!(node.active_socket(), Some(addr("10.0.0.5:40000")));
    }

    #[test]
    fn test_socket_change_clears_stale_pin() {
        let mut node = Node::new(
            Uuid::from_u128(1),
            NodeType::Agent,
            Some(addr("203.0.113.5:40000")),
            None,
            Duration::ZERO,
        );
        node.pin_socket(addr("203.0.113.5:40000"));
        node.set_sockets(Some(addr("203.0.113.9:40000")), None);
        assert_eq!(node.pinned_socket(), None);
    }
}
