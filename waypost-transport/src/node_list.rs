//! The node table and the socket it speaks through.
//!
//! [`LimitedNodeList`] owns the UDP socket, the `UUID → Node` map, the STUN
//! state and the drop-log throttle. It is owned by exactly one reactor at a
//! time: mutation needs `&mut self`, so there is a single writer and no lock.
//! In the worker process the whole list (socket included) moves between the
//! bootstrap loop and the worker execution context.
//!
//! Listeners learn about membership and public-address changes through
//! [`NodeListEvent`]s on an unbounded channel, see
//! [`take_event_receiver`](LimitedNodeList::take_event_receiver).

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use waypost_core::{
    DatagramSocket, NetworkProvider, NodeType, Providers, RandomProvider, TimeProvider,
};

use crate::error::NodeListError;
use crate::node::Node;
use crate::protocol::Packet;
use crate::stun::{self, TRANSACTION_ID_SIZE};
use crate::throttle::{DEFAULT_LOG_THROTTLE_INTERVAL, LogThrottle};
use crate::wire::{PacketView, WireError, write_packet};

/// Nodes silent for longer than this are evicted.
pub const NODE_SILENCE_THRESHOLD: Duration = Duration::from_secs(5);

/// How often owners should call [`LimitedNodeList::remove_silent_nodes`].
pub const SILENT_NODE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How often owners should refresh their public address over STUN.
pub const STUN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

type SocketOf<P> = <<P as Providers>::Network as NetworkProvider>::Socket;

/// Node table tuning.
#[derive(Debug, Clone)]
pub struct NodeListConfig {
    /// Silence after which a node is evicted.
    pub silence_threshold: Duration,
    /// Interval between two logged drops.
    pub log_throttle_interval: Duration,
}

impl Default for NodeListConfig {
    fn default() -> Self {
        Self {
            silence_threshold: NODE_SILENCE_THRESHOLD,
            log_throttle_interval: DEFAULT_LOG_THROTTLE_INTERVAL,
        }
    }
}

/// Notifications emitted by the node table.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeListEvent {
    /// A node was inserted.
    NodeAdded {
        /// New node.
        uuid: Uuid,
        /// Its type.
        node_type: NodeType,
    },
    /// A node was evicted or killed. Carries the removed record.
    NodeKilled(Node),
    /// STUN reported a new public socket for ourselves.
    PublicSocketChanged(SocketAddr),
}

#[derive(Debug)]
struct StunState {
    server: SocketAddr,
    transaction_id: Option<[u8; TRANSACTION_ID_SIZE]>,
}

/// UUID-keyed node table plus the socket it reaches nodes through.
pub struct LimitedNodeList<P: Providers> {
    providers: P,
    socket: SocketOf<P>,
    session_uuid: Uuid,
    nodes: HashMap<Uuid, Node>,
    config: NodeListConfig,
    public_socket: Option<SocketAddr>,
    stun: Option<StunState>,
    events_tx: mpsc::UnboundedSender<NodeListEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<NodeListEvent>>,
    drop_throttle: LogThrottle,
}

impl<P: Providers> std::fmt::Debug for LimitedNodeList<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitedNodeList")
            .field("session_uuid", &self.session_uuid)
            .field("local_addr", &self.socket.local_addr().ok())
            .field("public_socket", &self.public_socket)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl<P: Providers> LimitedNodeList<P> {
    /// Bind the socket and create an empty table.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the socket cannot be bound.
    pub async fn bind(
        providers: P,
        addr: SocketAddr,
        config: NodeListConfig,
    ) -> Result<Self, NodeListError> {
        let socket = providers.network().bind(addr).await?;
        let session_uuid = providers.random().new_uuid();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        info!(local = ?socket.local_addr().ok(), %session_uuid, "node list bound");
        Ok(Self {
            drop_throttle: LogThrottle::new(config.log_throttle_interval),
            providers,
            socket,
            session_uuid,
            nodes: HashMap::new(),
            config,
            public_socket: None,
            stun: None,
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    /// Provider bundle.
    pub fn providers(&self) -> &P {
        &self.providers
    }

    /// Current time from the time provider.
    pub fn now(&self) -> Duration {
        self.providers.time().now()
    }

    /// Our own identity.
    pub fn session_uuid(&self) -> Uuid {
        self.session_uuid
    }

    /// Adopt the identity the coordinator assigned to us.
    pub fn set_session_uuid(&mut self, uuid: Uuid) {
        if uuid != self.session_uuid {
            debug!(old = %self.session_uuid, new = %uuid, "session UUID changed");
            self.session_uuid = uuid;
        }
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, NodeListError> {
        Ok(self.socket.local_addr()?)
    }

    /// Public socket learned over STUN.
    pub fn public_socket(&self) -> Option<SocketAddr> {
        self.public_socket
    }

    /// Take the event receiver. Only the first call returns `Some`.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<NodeListEvent>> {
        self.events_rx.take()
    }

    fn emit(&self, event: NodeListEvent) {
        // Nobody listening is fine.
        let _ = self.events_tx.send(event);
    }

    /// Receive the next datagram.
    ///
    /// Cancellation safe: meant to be raced against timers.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NodeListError> {
        Ok(self.socket.recv_from(buf).await?)
    }

    /// Insert a node, or update the sockets of an existing one.
    pub fn add_or_update_node(
        &mut self,
        uuid: Uuid,
        node_type: NodeType,
        public_socket: Option<SocketAddr>,
        local_socket: Option<SocketAddr>,
    ) -> &mut Node {
        let now = self.now();
        match self.nodes.entry(uuid) {
            Entry::Occupied(entry) => {
                let node = entry.into_mut();
                if node.public_socket() != public_socket || node.local_socket() != local_socket {
                    debug!(%uuid, ?public_socket, ?local_socket, "node sockets updated");
                    node.set_sockets(public_socket, local_socket);
                }
                node
            }
            Entry::Vacant(entry) => {
                info!(%uuid, %node_type, ?public_socket, ?local_socket, "added node");
                let _ = self.events_tx.send(NodeListEvent::NodeAdded { uuid, node_type });
                entry.insert(Node::new(uuid, node_type, public_socket, local_socket, now))
            }
        }
    }

    /// Look up a node.
    pub fn node_with_uuid(&self, uuid: &Uuid) -> Option<&Node> {
        self.nodes.get(uuid)
    }

    /// Look up a node for mutation.
    pub fn node_with_uuid_mut(&mut self, uuid: &Uuid) -> Option<&mut Node> {
        self.nodes.get_mut(uuid)
    }

    /// The node a verified packet claims to come from.
    pub fn sending_node_for_packet(&self, packet: &PacketView<'_>) -> Option<&Node> {
        packet.sender_uuid().and_then(|uuid| self.nodes.get(&uuid))
    }

    /// All nodes, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All nodes, mutably.
    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn log_drop(&mut self, error: &WireError, from: SocketAddr) {
        let now = self.now();
        if let Some(suppressed) = self.drop_throttle.check(now) {
            warn!(%from, %error, suppressed, "dropping datagram");
        } else {
            trace!(%from, %error, "dropping datagram");
        }
    }

    /// Parse a datagram and check its version and hash.
    ///
    /// Exempt types pass after the version check. Verified types must come
    /// from a known node holding a connection secret and hash correctly; the
    /// sender's last-heard time and observed socket are then refreshed.
    /// Anything else returns `None` after a throttled log line.
    pub fn verify_packet<'a>(
        &mut self,
        datagram: &'a [u8],
        from: SocketAddr,
    ) -> Option<PacketView<'a>> {
        let view = match PacketView::parse(datagram) {
            Ok(view) => view,
            Err(error) => {
                self.log_drop(&error, from);
                return None;
            }
        };

        if !view.packet_type.is_verified() {
            return Some(view);
        }

        let Some(sender) = view.sender_uuid() else {
            self.log_drop(&WireError::MissingSender(view.packet_type), from);
            return None;
        };

        let secret = self.nodes.get(&sender).and_then(Node::connection_secret);
        let Some(secret) = secret else {
            let now = self.now();
            if let Some(suppressed) = self.drop_throttle.check(now) {
                warn!(
                    %from,
                    %sender,
                    packet_type = ?view.packet_type,
                    suppressed,
                    "dropping verified packet from unknown sender"
                );
            }
            return None;
        };

        if let Err(error) = view.verify(&secret) {
            self.log_drop(&error, from);
            return None;
        }

        let now = self.now();
        if let Some(node) = self.nodes.get_mut(&sender) {
            node.touch(now);
            node.set_observed_socket(from);
        }
        Some(view)
    }

    /// Evict every node silent for longer than the threshold.
    ///
    /// Emits [`NodeListEvent::NodeKilled`] per eviction and returns how many
    /// were evicted.
    pub fn remove_silent_nodes(&mut self) -> usize {
        let now = self.now();
        let threshold = self.config.silence_threshold;
        let silent: Vec<Uuid> = self
            .nodes
            .values()
            .filter(|node| now.saturating_sub(node.last_heard()) > threshold)
            .map(Node::uuid)
            .collect();

        for uuid in &silent {
            info!(%uuid, "evicting silent node");
            self.kill_node_with_uuid(uuid);
        }
        silent.len()
    }

    /// Remove a node and emit [`NodeListEvent::NodeKilled`].
    pub fn kill_node_with_uuid(&mut self, uuid: &Uuid) -> Option<Node> {
        let node = self.nodes.remove(uuid)?;
        debug!(%uuid, node_type = %node.node_type(), "killed node");
        self.emit(NodeListEvent::NodeKilled(node.clone()));
        Some(node)
    }

    /// Forget every node without emitting kill events.
    pub fn reset(&mut self) {
        debug!(count = self.nodes.len(), "resetting node list");
        self.nodes.clear();
    }

    /// Send a message to a known node through its active socket.
    ///
    /// Verified types are hashed with the node's connection secret; without a
    /// secret the hash is zeroed and the receiver drops the packet.
    ///
    /// # Errors
    ///
    /// `UnknownNode` or `NoActiveSocket` if the node cannot be reached,
    /// `Wire` if the packet is too large, `Io` if the send fails.
    pub async fn write_datagram<M: Packet>(
        &self,
        message: &M,
        node_uuid: &Uuid,
    ) -> Result<usize, NodeListError> {
        let node = self
            .nodes
            .get(node_uuid)
            .ok_or(NodeListError::UnknownNode(*node_uuid))?;
        let target = node
            .active_socket()
            .ok_or(NodeListError::NoActiveSocket(*node_uuid))?;
        let secret = node.connection_secret();
        self.write_datagram_to(message, target, secret.as_ref()).await
    }

    /// Send a message to an address, hashing with `secret` for verified types.
    pub async fn write_datagram_to<M: Packet>(
        &self,
        message: &M,
        target: SocketAddr,
        secret: Option<&Uuid>,
    ) -> Result<usize, NodeListError> {
        let datagram = write_packet(M::TYPE, &message.to_payload(), secret)?;
        trace!(%target, packet_type = ?M::TYPE, len = datagram.len(), "send");
        Ok(self.socket.send_to(&datagram, target).await?)
    }

    /// Send a message with no hash. Meant for exempt types.
    pub async fn write_unverified_datagram<M: Packet>(
        &self,
        message: &M,
        target: SocketAddr,
    ) -> Result<usize, NodeListError> {
        self.write_datagram_to(message, target, None).await
    }

    /// Send a pre-encoded payload of type `M` to an address.
    ///
    /// Used when one logical message is split over several datagrams.
    pub async fn write_payload_to<M: Packet>(
        &self,
        payload: &[u8],
        target: SocketAddr,
        secret: Option<&Uuid>,
    ) -> Result<usize, NodeListError> {
        let datagram = write_packet(M::TYPE, payload, secret)?;
        Ok(self.socket.send_to(&datagram, target).await?)
    }

    /// Use `server` for public-address discovery.
    pub fn set_stun_server(&mut self, server: SocketAddr) {
        self.stun = Some(StunState {
            server,
            transaction_id: None,
        });
    }

    /// Send a binding request to the STUN server with a fresh transaction ID.
    pub async fn send_stun_request(&mut self) -> Result<(), NodeListError> {
        let transaction_id: [u8; TRANSACTION_ID_SIZE] = self.providers.random().random();
        let stun_state = self.stun.as_mut().ok_or(NodeListError::NoStunServer)?;
        stun_state.transaction_id = Some(transaction_id);
        let server = stun_state.server;
        let request = stun::binding_request(&transaction_id);
        trace!(%server, "sending STUN binding request");
        self.socket.send_to(&request, server).await?;
        Ok(())
    }

    /// Handle a datagram recognised by [`stun::is_binding_response`].
    ///
    /// Returns the new public socket only when it changed; listeners are told
    /// through [`NodeListEvent::PublicSocketChanged`].
    pub fn process_stun_response(&mut self, datagram: &[u8]) -> Option<SocketAddr> {
        let expected = self.stun.as_ref().and_then(|s| s.transaction_id)?;
        let public_socket = match stun::parse_binding_response(datagram, Some(&expected)) {
            Ok(addr) => addr,
            Err(error) => {
                debug!(%error, "ignoring STUN response");
                return None;
            }
        };
        if self.public_socket == Some(public_socket) {
            return None;
        }
        info!(%public_socket, "public socket changed");
        self.public_socket = Some(public_socket);
        self.emit(NodeListEvent::PublicSocketChanged(public_socket));
        Some(public_socket)
    }
}

#[cfg(test)]
mod tests {
    use waypost_core::{ManualTimeProvider, MemoryNetwork, MemoryProviders};

    use super::*;
    use crate::protocol::{DomainListRequest, Ping};
    use crate::wire::PacketType;

    fn addr(s: &str) -> SocketAddr {
        s.parse().expect("addr")
    }

    async fn node_list(
        network: &MemoryNetwork,
        clock: &ManualTimeProvider,
        at: &str,
    ) -> LimitedNodeList<MemoryProviders> {
        let providers = MemoryProviders::new(network.clone(), 11).with_clock(clock.clone());
        LimitedNodeList::bind(providers, addr(at), NodeListConfig::default())
            .await
            .expect("bind")
    }

    #[tokio::test]
    async fn test_add_or_update_is_an_upsert() {
        let network = MemoryNetwork::new();
        let clock = ManualTimeProvider::new();
        let mut list = node_list(&network, &clock, "10.0.0.1:40102").await;
        let mut events = list.take_event_receiver().expect("receiver");

        let uuid = Uuid::from_u128(1);
        list.add_or_update_node(uuid, NodeType::Agent, Some(addr("203.0.113.1:1")), None);
        list.add_or_update_node(uuid, NodeType::Agent, Some(addr("203.0.113.1:2")), None);

        assert_eq!(list.len(), 1);
        assert_eq!(
            list.node_with_uuid(&uuid).and_then(Node::public_socket),
            Some(addr("203.0.113.1:2"))
        );
        assert_eq!(
            events.try_recv().expect("event"),
            NodeListEvent::NodeAdded {
                uuid,
                node_type: NodeType::Agent
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_verified_packet_from_known_node() {
        let network = MemoryNetwork::new();
        let clock = ManualTimeProvider::new();
        let mut list = node_list(&network, &clock, "10.0.0.1:40102").await;

        let sender = Uuid::from_u128(2);
        let secret = Uuid::from_u128(3);
        list.add_or_update_node(sender, NodeType::AudioMixer, None, None)
            .set_connection_secret(secret);

        let request = DomainListRequest {
            sender_uuid: sender,
            node_type: NodeType::AudioMixer,
            public_socket: None,
            local_socket: None,
            interests: vec![],
        };
        let payload = request.to_payload();
        let good = write_packet(PacketType::DomainListRequest, &payload, Some(&secret))
            .expect("write");
        let bad = write_packet(PacketType::DomainListRequest, &payload, Some(&Uuid::nil()))
            .expect("write");

        clock.advance(Duration::from_secs(3));
        assert!(list.verify_packet(&bad, addr("10.0.0.2:5")).is_none());
        assert_eq!(
            list.node_with_uuid(&sender).map(Node::last_heard),
            Some(Duration::ZERO)
        );

        let view = list.verify_packet(&good, addr("10.0.0.2:5")).expect("verified");
        assert_eq!(list.sending_node_for_packet(&view).map(Node::uuid), Some(sender));
        let node = list.node_with_uuid(&sender).expect("node");
        assert_eq!(node.last_heard(), Duration::from_secs(3));
        assert_eq!(node.active_socket(), Some(addr("10.0.0.2:5")));
    }

    #[tokio::test]
    async fn test_verified_packet_from_unknown_sender_dropped() {
        let network = MemoryNetwork::new();
        let clock = ManualTimeProvider::new();
        let mut list = node_list(&network, &clock, "10.0.0.1:40102").await;

        let ping = Ping {
            sender_uuid: Uuid::from_u128(77),
            timestamp_micros: 0,
        };
        let datagram = write_packet(PacketType::Ping, &ping.to_payload(), Some(&Uuid::from_u128(1)))
            .expect("write");
        assert!(list.verify_packet(&datagram, addr("10.0.0.9:1")).is_none());

        // known node without a secret is dropped too
        list.add_or_update_node(Uuid::from_u128(77), NodeType::Agent, None, None);
        assert!(list.verify_packet(&datagram, addr("10.0.0.9:1")).is_none());
    }

    #[tokio::test]
    async fn test_silent_nodes_are_evicted_with_event() {
        let network = MemoryNetwork::new();
        let clock = ManualTimeProvider::new();
        let mut list = node_list(&network, &clock, "10.0.0.1:40102").await;
        let mut events = list.take_event_receiver().expect("receiver");

        let old = Uuid::from_u128(1);
        let fresh = Uuid::from_u128(2);
        list.add_or_update_node(old, NodeType::AvatarMixer, None, None);
        clock.advance(Duration::from_secs(3));
        list.add_or_update_node(fresh, NodeType::Agent, None, None);

        clock.advance(Duration::from_secs(3));
        assert_eq!(list.remove_silent_nodes(), 1);
        assert!(list.node_with_uuid(&old).is_none());
        assert!(list.node_with_uuid(&fresh).is_some());

        let killed: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                NodeListEvent::NodeKilled(node) => Some(node.uuid()),
                _ => None,
            })
            .collect();
        assert_eq!(killed, vec![old]);
    }

    #[tokio::test]
    async fn test_write_datagram_uses_secret_and_active_socket() {
        let network = MemoryNetwork::new();
        let clock = ManualTimeProvider::new();
        let mut list = node_list(&network, &clock, "10.0.0.1:40102").await;
        let peer = network.bind(addr("10.0.0.2:40000")).await.expect("bind");

        let uuid = Uuid::from_u128(5);
        let secret = Uuid::from_u128(6);
        let node =
            list.add_or_update_node(uuid, NodeType::AudioMixer, None, Some(addr("10.0.0.2:40000")));
        node.set_connection_secret(secret);

        let ping = Ping {
            sender_uuid: list.session_uuid(),
            timestamp_micros: 9,
        };
        list.write_datagram(&ping, &uuid).await.expect("send");

        let (datagram, from) = peer.try_recv_from().expect("delivered");
        assert_eq!(from, addr("10.0.0.1:40102"));
        let view = PacketView::parse(&datagram).expect("parse");
        assert!(view.verify(&secret).is_ok());

        assert!(matches!(
            list.write_datagram(&ping, &Uuid::from_u128(99)).await,
            Err(NodeListError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn test_stun_response_notifies_only_on_change() {
        let network = MemoryNetwork::new();
        let clock = ManualTimeProvider::new();
        let mut list = node_list(&network, &clock, "10.0.0.1:40102").await;
        let stun_server = network.bind(addr("198.51.100.1:3478")).await.expect("bind");
        let mut events = list.take_event_receiver().expect("receiver");

        assert!(matches!(
            list.send_stun_request().await,
            Err(NodeListError::NoStunServer)
        ));

        list.set_stun_server(addr("198.51.100.1:3478"));
        list.send_stun_request().await.expect("request");
        let (request, _) = stun_server.try_recv_from().expect("request delivered");
        let transaction_id: [u8; 12] = request[8..20].try_into().expect("txid");

        let public = addr("192.0.2.1:4500");
        let response = crate::stun::tests::canned_response(public, &transaction_id);
        assert_eq!(list.process_stun_response(&response), Some(public));
        assert_eq!(list.process_stun_response(&response), None);
        assert_eq!(list.public_socket(), Some(public));

        assert_eq!(
            events.try_recv().expect("event"),
            NodeListEvent::PublicSocketChanged(public)
        );
        assert!(events.try_recv().is_err());
    }
}
