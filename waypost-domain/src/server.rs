//! The coordinator reactor.
//!
//! [`DomainServer`] owns the node list, the assignment registry, the
//! negotiator and the ICE candidate table. [`DomainServer::run`] drives it on
//! a single task: one `select!` over the socket, the periodic timers, the key
//! loader results and the shutdown signal. Handlers never overlap, so no
//! state is shared and nothing is locked.
//!
//! Every handler is also public so tests can drive the coordinator one
//! datagram or one timer tick at a time under a manual clock.

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use rsa::RsaPublicKey;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use uuid::Uuid;
use waypost_core::{AssignmentType, LocalPortSegment, NetworkProvider, Providers, RandomProvider};
use waypost_transport::protocol::{
    Assignment, DomainConnectRequest, DomainConnectionDenied, DomainList,
    DomainListRequest, DomainServerRemovedNode, IcePingReply, IceServerHeartbeatResponse,
    NodeDescriptor, RequestAssignment,
};
use waypost_transport::{
    DomainNodeData, IcePeers, LimitedNodeList, Node, NodeData, NodeListConfig, NodeListError,
    NodeListEvent, Packet, PacketType, stun,
};

use crate::config::{DomainServerConfig, TimingConfig};
use crate::error::DomainError;
use crate::keys::{KeyError, load_public_key};
use crate::negotiator::{Admission, ConnectDecision, ConnectionNegotiator, substitute_public_socket};
use crate::registry::AssignmentRegistry;
use crate::views::{AssignmentView, AssignmentsView, NodeView};

/// Receive buffer size; larger than any datagram we accept.
const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

type KeyResult = (String, Result<RsaPublicKey, KeyError>);

/// The domain coordinator.
pub struct DomainServer<P: Providers> {
    node_list: LimitedNodeList<P>,
    events: mpsc::UnboundedReceiver<NodeListEvent>,
    registry: AssignmentRegistry<P::Random>,
    negotiator: ConnectionNegotiator,
    ice_peers: IcePeers,
    ice_server: Option<SocketAddr>,
    stun_enabled: bool,
    public_keys_dir: Option<PathBuf>,
    key_results_tx: mpsc::UnboundedSender<KeyResult>,
    key_results_rx: mpsc::UnboundedReceiver<KeyResult>,
    timing: TimingConfig,
    port_segment: Option<LocalPortSegment>,
}

impl<P: Providers> DomainServer<P> {
    /// Validate `config`, bind the socket and queue the static assignments.
    ///
    /// # Errors
    ///
    /// `Config` for fatal misconfiguration, `Transport` if the port cannot
    /// be bound.
    pub async fn new(providers: P, config: DomainServerConfig) -> Result<Self, DomainError> {
        config.validate()?;

        let node_list_config = NodeListConfig {
            silence_threshold: config.timing.node_silence_threshold(),
            ..NodeListConfig::default()
        };
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
        let mut node_list =
            LimitedNodeList::bind(providers.clone(), bind_addr, node_list_config).await?;
        let events = node_list
            .take_event_receiver()
            .ok_or_else(|| NodeListError::Io(io::Error::other("node list events already taken")))?;

        let mut stun_enabled = false;
        if let Some(host) = &config.stun_server {
            match providers.network().resolve(host).await {
                Ok(server) => {
                    node_list.set_stun_server(server);
                    stun_enabled = true;
                }
                Err(error) => {
                    warn!(%error, host, "cannot resolve STUN server, public socket stays unknown")
                }
            }
        }

        let ice_server = match &config.ice_server {
            Some(host) => match providers.network().resolve(host).await {
                Ok(server) => Some(server),
                Err(error) => {
                    warn!(%error, host, "cannot resolve ICE server");
                    None
                }
            },
            None => None,
        };

        let mut registry = AssignmentRegistry::from_config(&config, providers.random().clone());
        registry.add_static_assignments_to_queue(&HashSet::new()).await;

        let (key_results_tx, key_results_rx) = mpsc::unbounded_channel();
        info!(local = ?node_list.local_addr().ok(), "domain server ready");

        Ok(Self {
            node_list,
            events,
            registry,
            negotiator: ConnectionNegotiator::new(config.allowed_users.iter().cloned()),
            ice_peers: IcePeers::default(),
            ice_server,
            stun_enabled,
            public_keys_dir: config.public_keys_dir.clone(),
            key_results_tx,
            key_results_rx,
            timing: config.timing.clone(),
            port_segment: None,
        })
    }

    /// Address the coordinator listens on.
    pub fn local_addr(&self) -> Result<SocketAddr, DomainError> {
        Ok(self.node_list.local_addr()?)
    }

    /// The node table.
    pub fn node_list(&self) -> &LimitedNodeList<P> {
        &self.node_list
    }

    /// The assignment registry.
    pub fn registry(&self) -> &AssignmentRegistry<P::Random> {
        &self.registry
    }

    /// The ICE candidate table.
    pub fn ice_peers(&self) -> &IcePeers {
        &self.ice_peers
    }

    /// Publish our port in the shared-memory segment `name`.
    ///
    /// The segment is unlinked when the server is dropped.
    pub fn publish_local_port(&mut self, name: &str) -> io::Result<()> {
        let port = self
            .node_list
            .local_addr()
            .map_err(|error| io::Error::other(error.to_string()))?
            .port();
        self.port_segment = Some(LocalPortSegment::publish(name, port)?);
        Ok(())
    }

    /// The published port segment, if any.
    pub fn port_segment(&self) -> Option<&LocalPortSegment> {
        self.port_segment.as_ref()
    }

    /// Queue a one-shot assignment.
    pub fn create_dynamic_assignment(
        &mut self,
        assignment_type: AssignmentType,
        pool: &str,
        payload: Vec<u8>,
    ) -> Uuid {
        self.registry.create_dynamic_assignment(assignment_type, pool, payload)
    }

    /// Snapshot of the admitted nodes, sorted by UUID.
    pub fn nodes_view(&self) -> Vec<NodeView> {
        let now = self.node_list.now();
        let mut nodes: Vec<NodeView> = self
            .node_list
            .nodes()
            .map(|node| NodeView::new(node, now))
            .collect();
        nodes.sort_by_key(|view| view.uuid);
        nodes
    }

    /// Snapshot of the queue and the static assignments.
    pub fn assignments_view(&self) -> AssignmentsView {
        let mut static_assignments: Vec<AssignmentView> =
            self.registry.static_assignments().map(AssignmentView::from).collect();
        static_assignments.sort_by_key(|view| (view.assignment_type, view.uuid));
        AssignmentsView {
            queued: self.registry.queue().map(AssignmentView::from).collect(),
            static_assignments,
        }
    }

    /// Handle one inbound datagram.
    pub async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        if stun::is_binding_response(datagram) {
            self.node_list.process_stun_response(datagram);
            self.process_node_events().await;
            return;
        }

        let Some(view) = self.node_list.verify_packet(datagram, from) else {
            return;
        };

        match view.packet_type {
            PacketType::RequestAssignment => {
                self.handle_request_assignment(view.payload, from).await
            }
            PacketType::CreateAssignment => self.handle_create_assignment(view.payload, from),
            PacketType::DomainConnectRequest => {
                self.handle_connect_request(view.payload, from).await
            }
            PacketType::DomainListRequest => self.handle_check_in(view.payload, from).await,
            PacketType::IceServerHeartbeatResponse => {
                if let Some(response) = decode::<IceServerHeartbeatResponse>(view.payload, from) {
                    let added = self.ice_peers.handle_heartbeat_response(&response);
                    debug!(added, "ICE heartbeat response");
                }
            }
            PacketType::IcePing => {
                if let Err(error) = self.node_list.answer_ice_ping(from).await {
                    debug!(%error, %from, "cannot answer ICE ping");
                }
            }
            PacketType::IcePingReply => {
                if let Some(reply) = decode::<IcePingReply>(view.payload, from) {
                    self.ice_peers.handle_ping_reply(&reply.sender_uuid, from);
                }
            }
            other => debug!(packet_type = ?other, %from, "ignoring packet"),
        }
    }

    async fn handle_request_assignment(&mut self, payload: &[u8], from: SocketAddr) {
        let Some(request) = decode::<RequestAssignment>(payload, from) else {
            return;
        };
        let Some(assignment) = self.registry.deploy(&request) else {
            debug!(
                %from,
                assignment_type = %request.assignment_type,
                pool = %request.pool,
                "no assignment for request"
            );
            return;
        };
        if let Err(error) = self.node_list.write_unverified_datagram(&assignment, from).await {
            warn!(%error, %from, "cannot send assignment");
        }
    }

    fn handle_create_assignment(&mut self, payload: &[u8], from: SocketAddr) {
        let Some(assignment) = decode::<Assignment>(payload, from) else {
            return;
        };
        if assignment.assignment_type == AssignmentType::AllTypes {
            debug!(%from, "ignoring wildcard assignment packet");
            return;
        }
        self.registry.create_dynamic_assignment(
            assignment.assignment_type,
            &assignment.pool,
            assignment.payload,
        );
    }

    async fn handle_connect_request(&mut self, payload: &[u8], from: SocketAddr) {
        let Some(request) = decode::<DomainConnectRequest>(payload, from) else {
            return;
        };

        let random = self.node_list.providers().random().clone();
        let decision = self
            .negotiator
            .evaluate(&request, from, &mut self.registry, &self.ice_peers, &random);

        match decision {
            ConnectDecision::Admit(admission) => {
                let node_uuid = self.admit(admission, from);
                self.send_domain_list(&node_uuid).await;
            }
            ConnectDecision::Drop(reason) => {
                debug!(%from, node_type = %request.node_type, ?reason, "dropping connect request");
            }
            ConnectDecision::FetchKey(username) => self.spawn_key_fetch(username),
            ConnectDecision::Deny(reason) => {
                warn!(%from, username = %request.username, %reason, "connection denied");
                let denied = DomainConnectionDenied { reason };
                if let Err(error) = self.node_list.write_unverified_datagram(&denied, from).await {
                    debug!(%error, %from, "cannot send denial");
                }
            }
        }
    }

    fn admit(&mut self, admission: Admission, from: SocketAddr) -> Uuid {
        let now = self.node_list.now();
        let connection_secret = self.node_list.providers().random().new_uuid();
        let node_uuid = admission.node_uuid;

        let node = self.node_list.add_or_update_node(
            node_uuid,
            admission.node_type,
            admission.public_socket,
            admission.local_socket,
        );
        let session_secrets = node
            .domain_data()
            .map(|data| data.session_secrets.clone())
            .unwrap_or_default();

        node.touch(now);
        node.set_connection_secret(connection_secret);
        node.set_observed_socket(from);
        if let Some(pinned) = admission.pinned_socket {
            node.pin_socket(pinned);
        }
        node.set_linked_data(NodeData::Domain(DomainNodeData {
            assignment_uuid: admission.assignment.map(|a| a.assignment_uuid),
            wallet_uuid: admission.assignment.and_then(|a| a.wallet_uuid),
            username: admission.username,
            interests: admission.interests,
            session_secrets,
        }));

        info!(
            %node_uuid,
            node_type = %admission.node_type,
            %from,
            assignment = ?admission.assignment.map(|a| a.assignment_uuid),
            "node admitted"
        );
        node_uuid
    }

    async fn handle_check_in(&mut self, payload: &[u8], from: SocketAddr) {
        let Some(request) = decode::<DomainListRequest>(payload, from) else {
            return;
        };
        let Some(node) = self.node_list.node_with_uuid_mut(&request.sender_uuid) else {
            return;
        };
        let public_socket = substitute_public_socket(request.public_socket, from);
        if node.public_socket() != public_socket || node.local_socket() != request.local_socket {
            node.set_sockets(public_socket, request.local_socket);
        }
        if let Some(data) = node.domain_data_mut() {
            data.interests = request.interests;
        }
        self.send_domain_list(&request.sender_uuid).await;
    }

    /// Peer list for `node_uuid`, minting pairwise secrets on first use.
    ///
    /// Empty when the node declared no interests.
    fn domain_list_for(&mut self, node_uuid: &Uuid) -> Option<DomainList> {
        let (interests, known, connection_secret) = {
            let node = self.node_list.node_with_uuid(node_uuid)?;
            let data = node.domain_data()?;
            (
                data.interests.clone(),
                data.session_secrets.clone(),
                node.connection_secret()?,
            )
        };

        let peers: Vec<NodeDescriptor> = self
            .node_list
            .nodes()
            .filter(|peer| peer.uuid() != *node_uuid && interests.contains(&peer.node_type()))
            .map(|peer| NodeDescriptor {
                node_type: peer.node_type(),
                uuid: peer.uuid(),
                public_socket: peer.public_socket(),
                local_socket: peer.local_socket(),
                connection_secret: Uuid::nil(),
            })
            .collect();

        let mut nodes = Vec::with_capacity(peers.len());
        for mut descriptor in peers {
            descriptor.connection_secret = match known.get(&descriptor.uuid) {
                Some(secret) => *secret,
                None => {
                    let secret = self.node_list.providers().random().new_uuid();
                    self.store_session_secret(node_uuid, &descriptor.uuid, secret);
                    self.store_session_secret(&descriptor.uuid, node_uuid, secret);
                    secret
                }
            };
            nodes.push(descriptor);
        }

        Some(DomainList {
            node_uuid: *node_uuid,
            connection_secret,
            nodes,
        })
    }

    fn store_session_secret(&mut self, owner: &Uuid, peer: &Uuid, secret: Uuid) {
        if let Some(data) = self
            .node_list
            .node_with_uuid_mut(owner)
            .and_then(Node::domain_data_mut)
        {
            data.session_secrets.insert(*peer, secret);
        }
    }

    async fn send_domain_list(&mut self, node_uuid: &Uuid) {
        let Some(list) = self.domain_list_for(node_uuid) else {
            return;
        };
        let target = self
            .node_list
            .node_with_uuid(node_uuid)
            .and_then(Node::active_socket);
        let Some(target) = target else {
            return;
        };
        for payload in list.chunk_payloads() {
            if let Err(error) = self
                .node_list
                .write_payload_to::<DomainList>(&payload, target, None)
                .await
            {
                warn!(%error, %node_uuid, "cannot send domain list");
                return;
            }
        }
    }

    /// Evict silent nodes and propagate the kills.
    pub async fn remove_silent_nodes(&mut self) {
        self.node_list.remove_silent_nodes();
        self.process_node_events().await;
    }

    /// Remove a node and propagate the kill.
    pub async fn kill_node(&mut self, uuid: &Uuid) -> bool {
        let killed = self.node_list.kill_node_with_uuid(uuid).is_some();
        self.process_node_events().await;
        killed
    }

    /// Apply queued node list events.
    pub async fn process_node_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                NodeListEvent::NodeKilled(node) => self.handle_node_killed(node).await,
                NodeListEvent::PublicSocketChanged(socket) => {
                    info!(public_socket = %socket, "coordinator public socket");
                }
                NodeListEvent::NodeAdded { .. } => {}
            }
        }
    }

    async fn handle_node_killed(&mut self, node: Node) {
        let killed = node.uuid();
        let removed = DomainServerRemovedNode { uuid: killed };

        let remaining: Vec<Uuid> = self.node_list.nodes().map(Node::uuid).collect();
        for uuid in &remaining {
            if let Err(error) = self.node_list.write_datagram(&removed, uuid).await {
                debug!(%error, node = %uuid, "cannot notify node of removal");
            }
        }
        for other in self.node_list.nodes_mut() {
            if let Some(data) = other.domain_data_mut() {
                data.session_secrets.remove(&killed);
            }
        }
        self.ice_peers.remove(&killed);

        if let Some(assignment_uuid) = node.domain_data().and_then(|data| data.assignment_uuid) {
            if self.registry.is_static(&assignment_uuid) {
                self.registry
                    .refresh_static_assignment_and_add_to_queue(&assignment_uuid)
                    .await;
            }
        }
    }

    /// Queue static assignments that are neither queued nor bound.
    pub async fn retry_static_assignments(&mut self) -> usize {
        let bound: HashSet<Uuid> = self
            .node_list
            .nodes()
            .filter_map(|node| node.domain_data().and_then(|data| data.assignment_uuid))
            .collect();
        self.registry.add_static_assignments_to_queue(&bound).await
    }

    /// Ask the STUN server for our public socket.
    pub async fn refresh_public_socket(&mut self) {
        if !self.stun_enabled {
            return;
        }
        if let Err(error) = self.node_list.send_stun_request().await {
            debug!(%error, "STUN request failed");
        }
    }

    /// Heartbeat to the ICE server.
    pub async fn send_ice_heartbeat(&mut self) {
        let Some(ice_server) = self.ice_server else {
            return;
        };
        if let Err(error) = self.node_list.send_ice_heartbeat(ice_server, None).await {
            debug!(%error, "ICE heartbeat failed");
        }
    }

    /// One ICE ping sweep.
    pub async fn ping_ice_peers(&mut self) {
        if let Err(error) = self.node_list.ping_ice_peers(&mut self.ice_peers).await {
            debug!(%error, "ICE ping sweep failed");
        }
    }

    fn spawn_key_fetch(&mut self, username: String) {
        let Some(dir) = self.public_keys_dir.clone() else {
            self.negotiator.keys_mut().insert(&username, None);
            return;
        };
        debug!(%username, "loading public key");
        let results = self.key_results_tx.clone();
        tokio::spawn(async move {
            let result = load_public_key(&dir, &username).await;
            let _ = results.send((username, result));
        });
    }

    fn apply_key_result(&mut self, username: String, result: Result<RsaPublicKey, KeyError>) {
        let key = match result {
            Ok(key) => Some(key),
            Err(error) => {
                warn!(%username, %error, "no usable public key");
                None
            }
        };
        self.negotiator.keys_mut().insert(&username, key);
    }

    /// Wait for the next key load to finish and cache its result.
    pub async fn next_key_result(&mut self) {
        if let Some((username, result)) = self.key_results_rx.recv().await {
            self.apply_key_result(username, result);
        }
    }

    /// Run the reactor until `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), DomainError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let timing = self.timing.clone();
        let mut sweep = interval(timing.silent_node_sweep());
        let mut stun_refresh = interval(timing.stun_refresh());
        let mut ice_heartbeat = interval(timing.ice_heartbeat());
        let mut ice_ping = interval(timing.ice_ping());
        let mut assignment_retry = interval(timing.assignment_retry());
        for timer in [
            &mut sweep,
            &mut stun_refresh,
            &mut ice_heartbeat,
            &mut ice_ping,
            &mut assignment_retry,
        ] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("domain server shutting down");
                    return Ok(());
                }
                received = self.node_list.recv(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                    Err(error) => warn!(%error, "receive failed"),
                },
                Some((username, result)) = self.key_results_rx.recv() => {
                    self.apply_key_result(username, result);
                }
                _ = sweep.tick() => self.remove_silent_nodes().await,
                _ = stun_refresh.tick() => self.refresh_public_socket().await,
                _ = ice_heartbeat.tick() => self.send_ice_heartbeat().await,
                _ = ice_ping.tick() => self.ping_ice_peers().await,
                _ = assignment_retry.tick() => {
                    self.retry_static_assignments().await;
                }
            }
        }
    }
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
