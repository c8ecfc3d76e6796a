//! Worker execution context.
//!
//! A [`WorkerContext`] owns the node list for the lifetime of one
//! assignment. It connects to the coordinator with the deploy UUID, checks in
//! every [`DOMAIN_CHECK_IN_INTERVAL`], keeps its peer table in step with the
//! coordinator's lists, and pings peers over the pairwise secrets it was
//! given. When the assignment ends the node list is reset and handed back to
//! the bootstrap loop as a [`WorkerTransport`].

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use uuid::Uuid;
use waypost_core::{Providers, RandomProvider};
use waypost_transport::protocol::{
    Assignment, DomainConnectRequest, DomainConnectionDenied, DomainList, DomainListRequest,
    DomainServerRemovedNode, Ping, PingReply,
};
use waypost_transport::{
    LimitedNodeList, Node, NodeData, NodeListError, NodeListEvent, Packet, PacketType, PeerNodeData,
    SILENT_NODE_SWEEP_INTERVAL,
};

use crate::factory::Workload;

/// Period between check-ins with the coordinator.
pub const DOMAIN_CHECK_IN_INTERVAL: Duration = Duration::from_secs(1);

/// Unanswered check-ins after which the assignment is abandoned.
pub const MAX_SILENT_DOMAIN_CHECK_INS: u32 = 5;

/// Period between ping sweeps over the peers.
pub const PEER_PING_INTERVAL: Duration = Duration::from_secs(1);

const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// The node list and its event stream, moved as one between the bootstrap
/// loop and a worker.
#[derive(Debug)]
pub struct WorkerTransport<P: Providers> {
    /// Node table and socket.
    pub node_list: LimitedNodeList<P>,
    /// Events emitted by `node_list`.
    pub events: mpsc::UnboundedReceiver<NodeListEvent>,
}

/// Why an assignment ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The coordinator stopped answering check-ins.
    DomainSilent,
    /// The coordinator refused the connection.
    Denied(String),
    /// Shut down from outside.
    Shutdown,
}

/// Runs one assignment.
#[derive(Debug)]
pub struct WorkerContext<P: Providers> {
    transport: WorkerTransport<P>,
    assignment: Assignment,
    workload: Workload,
    domain: SocketAddr,
    domain_secret: Option<Uuid>,
    silent_check_ins: u32,
}

impl<P: Providers> WorkerContext<P> {
    /// Take ownership of `transport` for `assignment`.
    pub fn new(
        transport: WorkerTransport<P>,
        assignment: Assignment,
        workload: Workload,
        domain: SocketAddr,
    ) -> Self {
        Self {
            transport,
            assignment,
            workload,
            domain,
            domain_secret: None,
            silent_check_ins: 0,
        }
    }

    /// The node table.
    pub fn node_list(&self) -> &LimitedNodeList<P> {
        &self.transport.node_list
    }

    /// The assignment being run.
    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    /// The workload being run.
    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    /// Whether the coordinator has sent us a peer list yet.
    pub fn is_connected(&self) -> bool {
        self.domain_secret.is_some()
    }

    /// Our node UUID as assigned by the coordinator.
    pub fn node_uuid(&self) -> Uuid {
        self.transport.node_list.session_uuid()
    }

    /// Ask to be admitted, presenting the deploy UUID.
    pub async fn send_connect_request(&self) -> Result<(), NodeListError> {
        let node_list = &self.transport.node_list;
        let request = DomainConnectRequest {
            node_type: self.workload.node_type(),
            inbound_uuid: Some(self.assignment.uuid),
            public_socket: node_list.public_socket(),
            local_socket: node_list.local_addr().ok(),
            interests: self.workload.interests().to_vec(),
            username: String::new(),
            username_signature: Vec::new(),
        };
        node_list.write_unverified_datagram(&request, self.domain).await?;
        Ok(())
    }

    /// One check-in tick.
    ///
    /// Re-sends the connect request until admitted, then a verified
    /// `DomainListRequest`. Returns an outcome once the coordinator has left
    /// [`MAX_SILENT_DOMAIN_CHECK_INS`] check-ins unanswered.
    pub async fn check_in(&mut self) -> Option<WorkerOutcome> {
        if self.silent_check_ins >= MAX_SILENT_DOMAIN_CHECK_INS {
            warn!(
                domain = %self.domain,
                silent = self.silent_check_ins,
                "domain server went silent"
            );
            return Some(WorkerOutcome::DomainSilent);
        }
        self.silent_check_ins += 1;

        let result = match self.domain_secret {
            None => self.send_connect_request().await,
            Some(secret) => {
                let node_list = &self.transport.node_list;
                let request = DomainListRequest {
                    sender_uuid: node_list.session_uuid(),
                    node_type: self.workload.node_type(),
                    public_socket: node_list.public_socket(),
                    local_socket: node_list.local_addr().ok(),
                    interests: self.workload.interests().to_vec(),
                };
                node_list
                    .write_datagram_to(&request, self.domain, Some(&secret))
                    .await
                    .map(|_| ())
            }
        };
        if let Err(error) = result {
            debug!(%error, "check-in failed");
        }
        None
    }

    /// Handle one inbound datagram. Returns an outcome if it ends the
    /// assignment.
    pub async fn handle_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
    ) -> Option<WorkerOutcome> {
        let view = self.transport.node_list.verify_packet(datagram, from)?;

        match view.packet_type {
            PacketType::DomainList
            | PacketType::DomainConnectionDenied
            | PacketType::DomainServerRemovedNode
                if from != self.domain =>
            {
                debug!(%from, packet_type = ?view.packet_type, "domain packet from a stranger");
            }
            PacketType::DomainList => {
                if let Some(list) = decode::<DomainList>(view.payload, from) {
                    self.ingest_domain_list(list);
                }
            }
            PacketType::DomainConnectionDenied => {
                let denied = decode::<DomainConnectionDenied>(view.payload, from)?;
                warn!(reason = %denied.reason, "domain server denied the connection");
                return Some(WorkerOutcome::Denied(denied.reason));
            }
            PacketType::DomainServerRemovedNode => {
                if let Some(removed) = decode::<DomainServerRemovedNode>(view.payload, from) {
                    self.transport.node_list.kill_node_with_uuid(&removed.uuid);
                }
            }
            PacketType::Ping => {
                if let Some(ping) = decode::<Ping>(view.payload, from) {
                    let reply = PingReply {
                        sender_uuid: self.node_uuid(),
                        ping_timestamp_micros: ping.timestamp_micros,
                    };
                    let node_list = &self.transport.node_list;
                    if let Err(error) = node_list.write_datagram(&reply, &ping.sender_uuid).await {
                        debug!(%error, peer = %ping.sender_uuid, "cannot answer ping");
                    }
                }
            }
            PacketType::PingReply => {
                if let Some(reply) = decode::<PingReply>(view.payload, from) {
                    let now = micros(self.transport.node_list.now());
                    let rtt =
                        Duration::from_micros(now.saturating_sub(reply.ping_timestamp_micros));
                    if let Some(data) = self
                        .transport
                        .node_list
                        .node_with_uuid_mut(&reply.sender_uuid)
                        .and_then(Node::peer_data_mut)
                    {
                        data.last_ping_rtt = Some(rtt);
                    }
                }
            }
            PacketType::IcePing => {
                if let Err(error) = self.transport.node_list.answer_ice_ping(from).await {
                    debug!(%error, %from, "cannot answer ICE ping");
                }
            }
            other => debug!(packet_type = ?other, %from, "ignoring packet"),
        }
        self.drain_events();
        None
    }

    fn ingest_domain_list(&mut self, list: DomainList) {
        self.silent_check_ins = 0;
        if self.domain_secret.is_none() {
            info!(
                node_uuid = %list.node_uuid,
                assignment = %self.assignment.uuid,
                "connected to domain server"
            );
        }
        self.domain_secret = Some(list.connection_secret);

        let node_list = &mut self.transport.node_list;
        node_list.set_session_uuid(list.node_uuid);
        let now = node_list.now();
        for peer in list.nodes {
            let node = node_list.add_or_update_node(
                peer.uuid,
                peer.node_type,
                peer.public_socket,
                peer.local_socket,
            );
            node.set_connection_secret(peer.connection_secret);
            node.touch(now);
            if node.peer_data().is_none() {
                node.set_linked_data(NodeData::Peer(PeerNodeData::default()));
            }
        }
    }

    /// Send a verified ping to every peer. Returns how many were sent.
    pub async fn ping_peers(&mut self) -> usize {
        let ping = Ping {
            sender_uuid: self.node_uuid(),
            timestamp_micros: micros(self.transport.node_list.now()),
        };
        let peers: Vec<Uuid> = self
            .transport
            .node_list
            .nodes()
            .filter(|node| node.connection_secret().is_some())
            .map(Node::uuid)
            .collect();

        let mut sent = 0;
        for uuid in peers {
            match self.transport.node_list.write_datagram(&ping, &uuid).await {
                Ok(_) => {
                    sent += 1;
                    if let Some(data) = self
                        .transport
                        .node_list
                        .node_with_uuid_mut(&uuid)
                        .and_then(Node::peer_data_mut)
                    {
                        data.pings_sent += 1;
                    }
                }
                Err(error) => debug!(%error, peer = %uuid, "cannot ping peer"),
            }
        }
        sent
    }

    /// Evict peers that have gone silent.
    pub fn remove_silent_peers(&mut self) {
        self.transport.node_list.remove_silent_nodes();
        self.drain_events();
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.transport.events.try_recv() {
            match event {
                NodeListEvent::NodeAdded { uuid, node_type } => {
                    debug!(%uuid, %node_type, "peer added")
                }
                NodeListEvent::NodeKilled(node) => {
                    info!(uuid = %node.uuid(), node_type = %node.node_type(), "peer removed")
                }
                NodeListEvent::PublicSocketChanged(socket) => {
                    debug!(public_socket = %socket, "public socket changed")
                }
            }
        }
    }

    /// Receive and handle one datagram.
    pub async fn process_next_datagram(&mut self) -> Result<Option<WorkerOutcome>, NodeListError> {
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        let (len, from) = self.transport.node_list.recv(&mut buf).await?;
        Ok(self.handle_datagram(&buf[..len], from).await)
    }

    /// Forget every peer and hand the node list back.
    pub fn finish(mut self) -> WorkerTransport<P> {
        self.drain_events();
        let fresh = self.transport.node_list.providers().random().new_uuid();
        self.transport.node_list.reset();
        self.transport.node_list.set_session_uuid(fresh);
        self.transport
    }

    /// Run until the assignment ends or `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F) -> (WorkerTransport<P>, WorkerOutcome)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            assignment = %self.assignment.uuid,
            assignment_type = %self.workload.assignment_type(),
            "running assignment"
        );

        let mut check_in = interval(DOMAIN_CHECK_IN_INTERVAL);
        let mut ping = interval(PEER_PING_INTERVAL);
        let mut sweep = interval(SILENT_NODE_SWEEP_INTERVAL);
        for timer in [&mut check_in, &mut ping, &mut sweep] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        let outcome = loop {
            tokio::select! {
                () = &mut shutdown => break WorkerOutcome::Shutdown,
                received = self.transport.node_list.recv(&mut buf) => match received {
                    Ok((len, from)) => {
                        if let Some(outcome) = self.handle_datagram(&buf[..len], from).await {
                            break outcome;
                        }
                    }
                    Err(error) => warn!(%error, "receive failed"),
                },
                _ = check_in.tick() => {
                    if let Some(outcome) = self.check_in().await {
                        break outcome;
                    }
                }
                _ = ping.tick() => {
                    self.ping_peers().await;
                }
                _ = sweep.tick() => self.remove_silent_peers(),
            }
        };

        info!(assignment = %self.assignment.uuid, ?outcome, "assignment finished");
        (self.finish(), outcome)
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

fn decode<M: Packet>(payload: &[u8], from: SocketAddr) -> Option<M> {
    match M::from_payload(payload) {
        Ok(message) => Some(message),
        Err(error) => {
            debug!(%error, %from, packet_type = ?M::TYPE, "malformed payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use waypost_core::{AssignmentType, MemoryNetwork, MemoryProviders, NodeType};
    use waypost_transport::protocol::NodeDescriptor;
    use waypost_transport::NodeListConfig;

    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().expect("socket address")
    }

    async fn bind(
        network: &MemoryNetwork,
        at: &str,
        seed: u64,
    ) -> LimitedNodeList<MemoryProviders> {
        let providers = MemoryProviders::new(network.clone(), seed);
        LimitedNodeList::bind(providers, addr(at), NodeListConfig::default())
            .await
            .expect("bind")
    }

    async fn worker(network: &MemoryNetwork, domain: SocketAddr) -> WorkerContext<MemoryProviders> {
        let mut node_list = bind(network, "127.0.0.1:0", 3).await;
        let events = node_list.take_event_receiver().expect("events");
        let assignment = Assignment::new(Uuid::from_u128(9), AssignmentType::AudioMixer, "");
        let transport = WorkerTransport { node_list, events };
        WorkerContext::new(transport, assignment, Workload::AudioMixer, domain)
    }

    async fn deliver<M: Packet>(
        worker: &mut WorkerContext<MemoryProviders>,
        message: &M,
        from: SocketAddr,
    ) -> Option<WorkerOutcome> {
        let datagram =
            waypost_transport::write_packet(M::TYPE, &message.to_payload(), None).expect("packet");
        worker.handle_datagram(&datagram, from).await
    }

    fn list_with_peer() -> DomainList {
        DomainList {
            node_uuid: Uuid::from_u128(0x10),
            connection_secret: Uuid::from_u128(0x20),
            nodes: vec![NodeDescriptor {
                node_type: NodeType::Agent,
                uuid: Uuid::from_u128(0x30),
                public_socket: None,
                local_socket: Some(addr("127.0.0.1:6000")),
                connection_secret: Uuid::from_u128(0x40),
            }],
        }
    }

    #[tokio::test]
    async fn test_connect_request_carries_deploy_uuid() {
        let network = MemoryNetwork::new();
        let domain = bind(&network, "127.0.0.1:40102", 1).await;
        let mut worker = worker(&network, addr("127.0.0.1:40102")).await;

        assert!(worker.check_in().await.is_none());
        let mut buf = vec![0u8; 2048];
        let (len, _) = domain.recv(&mut buf).await.expect("recv");
        let view = waypost_transport::PacketView::parse(&buf[..len]).expect("envelope");
        let request = DomainConnectRequest::from_payload(view.payload).expect("connect request");
        assert_eq!(request.inbound_uuid, Some(Uuid::from_u128(9)));
        assert_eq!(request.node_type, NodeType::AudioMixer);
        assert_eq!(request.interests, vec![NodeType::Agent]);
    }

    #[tokio::test]
    async fn test_domain_list_admits_and_adds_peers() {
        let network = MemoryNetwork::new();
        let domain = addr("127.0.0.1:40102");
        let mut worker = worker(&network, domain).await;

        assert!(deliver(&mut worker, &list_with_peer(), domain).await.is_none());
        assert!(worker.is_connected());
        assert_eq!(worker.node_uuid(), Uuid::from_u128(0x10));

        let peer = worker.node_list().node_with_uuid(&Uuid::from_u128(0x30)).expect("peer");
        assert_eq!(peer.connection_secret(), Some(Uuid::from_u128(0x40)));
        assert!(peer.peer_data().is_some());

        let removed = DomainServerRemovedNode {
            uuid: Uuid::from_u128(0x30),
        };
        deliver(&mut worker, &removed, domain).await;
        assert!(worker.node_list().is_empty());
    }

    #[tokio::test]
    async fn test_domain_packets_from_strangers_are_ignored() {
        let network = MemoryNetwork::new();
        let domain = addr("127.0.0.1:40102");
        let mut worker = worker(&network, domain).await;

        let denied = DomainConnectionDenied { reason: "go away".into() };
        assert!(deliver(&mut worker, &denied, addr("127.0.0.1:666")).await.is_none());
        assert!(deliver(&mut worker, &list_with_peer(), addr("127.0.0.1:666")).await.is_none());
        assert!(!worker.is_connected());

        assert_eq!(
            deliver(&mut worker, &denied, domain).await,
            Some(WorkerOutcome::Denied("go away".into()))
        );
    }

    #[tokio::test]
    async fn test_silent_domain_ends_assignment() {
        let network = MemoryNetwork::new();
        let domain = addr("127.0.0.1:40102");
        let mut worker = worker(&network, domain).await;
        deliver(&mut worker, &list_with_peer(), domain).await;

        for _ in 0..MAX_SILENT_DOMAIN_CHECK_INS {
            assert!(worker.check_in().await.is_none());
        }
        // an answer resets the count
        deliver(&mut worker, &list_with_peer(), domain).await;
        for _ in 0..MAX_SILENT_DOMAIN_CHECK_INS {
            assert!(worker.check_in().await.is_none());
        }
        assert_eq!(worker.check_in().await, Some(WorkerOutcome::DomainSilent));
    }

    #[tokio::test]
    async fn test_finish_resets_the_node_list() {
        let network = MemoryNetwork::new();
        let domain = addr("127.0.0.1:40102");
        let mut worker = worker(&network, domain).await;
        deliver(&mut worker, &list_with_peer(), domain).await;

        let transport = worker.finish();
        assert!(transport.node_list.is_empty());
        assert_ne!(transport.node_list.session_uuid(), Uuid::from_u128(0x10));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let network = MemoryNetwork::new();
        let worker = worker(&network, addr("127.0.0.1:40102")).await;
        let (transport, outcome) = worker.run(async {}).await;
        assert_eq!(outcome, WorkerOutcome::Shutdown);
        assert!(transport.node_list.is_empty());
    }
}
