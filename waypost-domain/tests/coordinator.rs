//! The coordinator driven one datagram at a time over the in-memory network.
//!
//! Tests verify that:
//! - A worker's request is answered with a unique deploy copy, and connecting
//!   with that deploy UUID admits it and consumes the assignment
//! - Statically assigned nodes with an unknown deploy UUID are dropped
//! - Pools select assignments and offers rotate through the queue
//! - Remote users go through the allow-list and signature check
//! - Silent nodes are evicted, peers are told, and static work is re-issued
//! - Check-ins refresh interests and share one pairwise secret per pair

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use waypost_core::{
    AssignmentType, DatagramSocket, ManualTimeProvider, MemoryNetwork, MemoryProviders,
    MemorySocket, NetworkProvider, NodeType, Uuid,
};
use waypost_domain::{AssignmentConfig, DomainServer, DomainServerConfig};
use waypost_transport::protocol::{
    Assignment, DomainConnectRequest, DomainConnectionDenied, DomainList,
    DomainListRequest, DomainServerRemovedNode, RequestAssignment,
};
use waypost_transport::{Packet, PacketView, write_packet};

const ALICE_PRIVATE: &str = include_str!("fixtures/private_keys/alice.key.pem");
const MALLORY_PRIVATE: &str = include_str!("fixtures/private_keys/mallory.key.pem");

fn addr(s: &str) -> SocketAddr {
    s.parse().expect("socket address")
}

fn only(enabled: &[AssignmentType]) -> DomainServerConfig {
    DomainServerConfig {
        disabled_types: AssignmentType::CONCRETE
            .into_iter()
            .filter(|t| !enabled.contains(t))
            .collect(),
        ..Default::default()
    }
}

struct Harness {
    network: MemoryNetwork,
    clock: ManualTimeProvider,
    server: DomainServer<MemoryProviders>,
}

impl Harness {
    async fn new(config: DomainServerConfig) -> Self {
        let network = MemoryNetwork::new();
        let clock = ManualTimeProvider::new();
        let providers = MemoryProviders::new(network.clone(), 7).with_clock(clock.clone());
        let server = DomainServer::new(providers, config).await.expect("server");
        Self { network, clock, server }
    }

    async fn socket(&self, at: &str) -> MemorySocket {
        self.network.bind(addr(at)).await.expect("bind")
    }

    async fn send<M: Packet>(&mut self, socket: &MemorySocket, message: &M, secret: Option<&Uuid>) {
        let datagram = write_packet(M::TYPE, &message.to_payload(), secret).expect("packet");
        let from = socket.local_addr().expect("local addr");
        self.server.handle_datagram(&datagram, from).await;
    }

    async fn request(
        &mut self,
        socket: &MemorySocket,
        assignment_type: AssignmentType,
        pool: &str,
    ) -> Option<Assignment> {
        let request = RequestAssignment {
            assignment_type,
            pool: pool.to_string(),
            wallet_uuid: None,
        };
        self.send(socket, &request, None).await;
        try_receive(socket)
    }

    async fn connect(
        &mut self,
        socket: &MemorySocket,
        request: DomainConnectRequest,
    ) -> Option<DomainList> {
        self.send(socket, &request, None).await;
        try_receive(socket)
    }
}

fn try_receive<M: Packet>(socket: &MemorySocket) -> Option<M> {
    let (datagram, _) = socket.try_recv_from()?;
    let view = PacketView::parse(&datagram).expect("envelope");
    assert_eq!(view.packet_type, M::TYPE, "unexpected packet type");
    Some(M::from_payload(view.payload).expect("payload"))
}

fn connect_request(
    node_type: NodeType,
    inbound_uuid: Option<Uuid>,
    interests: Vec<NodeType>,
) -> DomainConnectRequest {
    DomainConnectRequest {
        node_type,
        inbound_uuid,
        public_socket: None,
        local_socket: None,
        interests,
        username: String::new(),
        username_signature: Vec::new(),
    }
}

fn signed(username: &str, private_pem: &str) -> DomainConnectRequest {
    let signature = RsaPrivateKey::from_pkcs8_pem(private_pem)
        .expect("private key")
        .sign(Pkcs1v15Sign::new_unprefixed(), username.as_bytes())
        .expect("sign");
    DomainConnectRequest {
        username: username.to_string(),
        username_signature: signature,
        ..connect_request(NodeType::Agent, None, vec![])
    }
}

/// Deploy and connect an audio mixer; returns (node uuid, static uuid).
async fn admit_mixer(
    harness: &mut Harness,
    worker: &MemorySocket,
    node: &MemorySocket,
) -> (Uuid, Uuid) {
    let static_uuid = harness.server.assignments_view().static_assignments[0].uuid;
    let deployed = harness
        .request(worker, AssignmentType::AllTypes, "")
        .await
        .expect("assignment");
    let request = connect_request(
        NodeType::AudioMixer,
        Some(deployed.uuid),
        vec![NodeType::Agent],
    );
    let list = harness
        .connect(node, request)
        .await
        .expect("domain list");
    (list.node_uuid, static_uuid)
}

#[tokio::test]
async fn test_deploy_then_connect() {
    let mut harness = Harness::new(only(&[AssignmentType::AudioMixer])).await;
    let worker = harness.socket("127.0.0.1:50000").await;
    let node = harness.socket("127.0.0.1:50001").await;

    let static_uuid = harness.server.assignments_view().static_assignments[0].uuid;
    assert_eq!(harness.server.registry().queue_len(), 1);

    let request = RequestAssignment {
        assignment_type: AssignmentType::AudioMixer,
        pool: String::new(),
        wallet_uuid: Some(Uuid::from_u128(0xa11e7)),
    };
    harness.send(&worker, &request, None).await;
    let deployed: Assignment = try_receive(&worker).expect("assignment");
    assert_eq!(deployed.assignment_type, AssignmentType::AudioMixer);
    assert_ne!(deployed.uuid, static_uuid);
    assert_eq!(deployed.wallet_uuid, request.wallet_uuid);
    assert_eq!(harness.server.registry().queue_len(), 1, "offer keeps the assignment queued");

    let list = harness
        .connect(&node, connect_request(NodeType::AudioMixer, Some(deployed.uuid), vec![]))
        .await
        .expect("domain list");
    assert!(list.nodes.is_empty());
    assert_eq!(harness.server.registry().queue_len(), 0);

    let views = harness.server.nodes_view();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].uuid, list.node_uuid);
    assert_eq!(views[0].assignment_uuid, Some(static_uuid));
    assert_eq!(views[0].wallet_uuid, request.wallet_uuid);

    // the deploy UUID is spent
    let again = harness
        .connect(&node, connect_request(NodeType::AudioMixer, Some(deployed.uuid), vec![]))
        .await;
    assert!(again.is_none());
    assert_eq!(harness.server.node_list().len(), 1);
}

#[tokio::test]
async fn test_unknown_deploy_uuid_is_dropped() {
    let mut harness = Harness::new(only(&[AssignmentType::AudioMixer])).await;
    let node = harness.socket("127.0.0.1:50001").await;

    let reply = harness
        .connect(&node, connect_request(NodeType::AudioMixer, Some(Uuid::from_u128(42)), vec![]))
        .await;
    assert!(reply.is_none());
    let reply = harness
        .connect(&node, connect_request(NodeType::AudioMixer, None, vec![]))
        .await;
    assert!(reply.is_none());

    assert!(harness.server.node_list().is_empty());
    assert_eq!(harness.server.registry().queue_len(), 1);
}

#[tokio::test]
async fn test_pools_and_offer_rotation() {
    let mut assignments = std::collections::BTreeMap::new();
    assignments.insert(
        AssignmentType::Agent,
        vec![AssignmentConfig {
            pool: "numerics".into(),
            payload: "print(1)".into(),
            count: 2,
        }],
    );
    let config = DomainServerConfig {
        assignments,
        ..only(&[AssignmentType::Agent])
    };
    let mut harness = Harness::new(config).await;
    let worker = harness.socket("127.0.0.1:50000").await;

    assert_eq!(harness.server.registry().queue_len(), 2);
    assert!(harness.request(&worker, AssignmentType::Agent, "").await.is_none());
    assert!(harness.request(&worker, AssignmentType::AudioMixer, "numerics").await.is_none());

    let head = harness.server.assignments_view().queued[0].uuid;
    let first = harness
        .request(&worker, AssignmentType::AllTypes, "numerics")
        .await
        .expect("first offer");
    assert_eq!(first.payload, b"print(1)");
    assert_eq!(first.pool, "numerics");

    let queued = harness.server.assignments_view().queued;
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[1].uuid, head, "offered assignment moves to the tail");

    let second = harness
        .request(&worker, AssignmentType::Agent, "numerics")
        .await
        .expect("second offer");
    assert_ne!(second.uuid, first.uuid);
}

#[tokio::test]
async fn test_create_assignment_packet_queues_dynamic_work() {
    let mut harness = Harness::new(only(&[])).await;
    let client = harness.socket("127.0.0.1:50000").await;

    let create = Assignment::new(Uuid::nil(), AssignmentType::Agent, "scripts")
        .with_payload(b"run()".to_vec());
    harness.send(&client, &create, None).await;

    let queued = harness.server.assignments_view().queued;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].pool, "scripts");
    assert_eq!(queued[0].payload, "run()");
    assert!(!queued[0].is_static);
    assert!(harness.server.assignments_view().static_assignments.is_empty());
}

#[tokio::test]
async fn test_allow_list_with_signed_usernames() {
    let config = DomainServerConfig {
        allowed_users: vec!["alice".into()],
        public_keys_dir: Some(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/public_keys"),
        ),
        ..only(&[])
    };
    let mut harness = Harness::new(config).await;
    let alice = harness.socket("203.0.113.7:6000").await;
    let stranger = harness.socket("203.0.113.8:6000").await;
    let neighbour = harness.socket("192.168.1.20:6000").await;

    // the first attempt starts the key load and is dropped
    assert!(harness.connect(&alice, signed("alice", ALICE_PRIVATE)).await.is_none());
    harness.server.next_key_result().await;

    let list = harness
        .connect(&alice, signed("alice", ALICE_PRIVATE))
        .await
        .expect("alice admitted");
    let view = harness
        .server
        .nodes_view()
        .into_iter()
        .find(|view| view.uuid == list.node_uuid)
        .expect("alice listed");
    assert_eq!(view.username.as_deref(), Some("alice"));
    assert_eq!(view.public_socket, Some(addr("203.0.113.7:6000")));

    harness.send(&stranger, &signed("alice", MALLORY_PRIVATE), None).await;
    let denied: DomainConnectionDenied = try_receive(&stranger).expect("forged signature denied");
    assert!(denied.reason.contains("alice"));

    harness.send(&stranger, &signed("mallory", MALLORY_PRIVATE), None).await;
    assert!(try_receive::<DomainConnectionDenied>(&stranger).is_some());

    harness
        .send(&stranger, &connect_request(NodeType::Agent, None, vec![]), None)
        .await;
    assert!(try_receive::<DomainConnectionDenied>(&stranger).is_some());

    // private addresses skip the list
    let list = harness
        .connect(&neighbour, connect_request(NodeType::Agent, None, vec![]))
        .await;
    assert!(list.is_some());
    assert_eq!(harness.server.node_list().len(), 2);
}

#[tokio::test]
async fn test_silent_node_is_evicted_and_reissued() {
    let mut harness = Harness::new(only(&[AssignmentType::AudioMixer])).await;
    let worker = harness.socket("127.0.0.1:50000").await;
    let mixer = harness.socket("127.0.0.1:50001").await;
    let agent = harness.socket("127.0.0.1:50002").await;

    let (mixer_uuid, static_uuid) = admit_mixer(&mut harness, &worker, &mixer).await;
    let list = harness
        .connect(&agent, connect_request(NodeType::Agent, None, vec![NodeType::AudioMixer]))
        .await
        .expect("agent admitted");
    assert_eq!(list.nodes.len(), 1);
    assert_eq!(list.nodes[0].uuid, mixer_uuid);

    harness.clock.advance(Duration::from_secs(3));
    let check_in = DomainListRequest {
        sender_uuid: list.node_uuid,
        node_type: NodeType::Agent,
        public_socket: None,
        local_socket: None,
        interests: vec![NodeType::AudioMixer],
    };
    harness.send(&agent, &check_in, Some(&list.connection_secret)).await;
    assert!(try_receive::<DomainList>(&agent).is_some());

    harness.clock.advance(Duration::from_secs(3));
    harness.server.remove_silent_nodes().await;

    assert!(harness.server.node_list().node_with_uuid(&mixer_uuid).is_none());
    assert!(harness.server.node_list().node_with_uuid(&list.node_uuid).is_some());

    let removed: DomainServerRemovedNode = try_receive(&agent).expect("removal notice");
    assert_eq!(removed.uuid, mixer_uuid);

    assert!(!harness.server.registry().contains(&static_uuid));
    let assignments = harness.server.assignments_view();
    assert_eq!(assignments.static_assignments.len(), 1);
    let reissued = assignments.static_assignments[0].uuid;
    assert_ne!(reissued, static_uuid);
    assert_eq!(assignments.queued.len(), 1);
    assert_eq!(assignments.queued[0].uuid, reissued);
}

#[tokio::test]
async fn test_check_in_shares_pairwise_secret() {
    let mut harness = Harness::new(only(&[])).await;
    let a = harness.socket("127.0.0.1:50001").await;
    let b = harness.socket("127.0.0.1:50002").await;

    let list_a = harness
        .connect(&a, connect_request(NodeType::Agent, None, vec![]))
        .await
        .expect("a admitted");
    let list_b = harness
        .connect(&b, connect_request(NodeType::Agent, None, vec![]))
        .await
        .expect("b admitted");
    assert!(list_b.nodes.is_empty());

    let check_in = |uuid: Uuid| DomainListRequest {
        sender_uuid: uuid,
        node_type: NodeType::Agent,
        public_socket: None,
        local_socket: Some(addr("10.1.0.5:7000")),
        interests: vec![NodeType::Agent],
    };

    // a wrong secret gets nothing
    harness.send(&a, &check_in(list_a.node_uuid), Some(&list_b.connection_secret)).await;
    assert!(try_receive::<DomainList>(&a).is_none());

    harness.send(&a, &check_in(list_a.node_uuid), Some(&list_a.connection_secret)).await;
    let seen_by_a: DomainList = try_receive(&a).expect("list for a");
    assert_eq!(seen_by_a.nodes.len(), 1);
    assert_eq!(seen_by_a.nodes[0].uuid, list_b.node_uuid);

    harness.send(&b, &check_in(list_b.node_uuid), Some(&list_b.connection_secret)).await;
    let seen_by_b: DomainList = try_receive(&b).expect("list for b");
    assert_eq!(seen_by_b.nodes[0].uuid, list_a.node_uuid);
    assert_eq!(seen_by_b.nodes[0].local_socket, Some(addr("10.1.0.5:7000")));
    assert_eq!(seen_by_b.nodes[0].connection_secret, seen_by_a.nodes[0].connection_secret);
}
