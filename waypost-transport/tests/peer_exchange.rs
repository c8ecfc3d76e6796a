//! Two node lists talking over the in-memory network.
//!
//! Tests verify that:
//! - Verified pings pass between peers sharing a pairwise secret
//! - A peer holding the wrong secret has its pings dropped, with no reply
//! - ICE hole punching pins the socket the first reply arrived on

use std::net::SocketAddr;

use waypost_core::{ManualTimeProvider, MemoryNetwork, MemoryProviders};
use waypost_transport::protocol::{IcePeerDescriptor, IcePingReply, Ping, PingReply};
use waypost_transport::{
    IcePeers, LimitedNodeList, NodeListConfig, NodeType, Packet, PacketType, PacketView, Uuid,
};

fn addr(s: &str) -> SocketAddr {
    s.parse().expect("socket address")
}

async fn bind(
    network: &MemoryNetwork,
    clock: &ManualTimeProvider,
    at: &str,
    seed: u64,
) -> LimitedNodeList<MemoryProviders> {
    let providers = MemoryProviders::new(network.clone(), seed).with_clock(clock.clone());
    LimitedNodeList::bind(providers, addr(at), NodeListConfig::default())
        .await
        .expect("bind")
}

async fn recv(list: &LimitedNodeList<MemoryProviders>) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 2048];
    let (len, from) = tokio::time::timeout(std::time::Duration::from_secs(1), list.recv(&mut buf))
        .await
        .expect("datagram within a second")
        .expect("recv");
    buf.truncate(len);
    (buf, from)
}

#[tokio::test]
async fn test_verified_ping_round_trip() {
    let network = MemoryNetwork::new();
    let clock = ManualTimeProvider::new();
    let mut mixer = bind(&network, &clock, "10.0.0.1:40000", 1).await;
    let mut agent = bind(&network, &clock, "10.0.0.2:40000", 2).await;
    let secret = Uuid::from_u128(0xfeed);

    let mixer_uuid = mixer.session_uuid();
    let agent_uuid = agent.session_uuid();
    mixer
        .add_or_update_node(agent_uuid, NodeType::Agent, None, Some(addr("10.0.0.2:40000")))
        .set_connection_secret(secret);
    agent
        .add_or_update_node(mixer_uuid, NodeType::AudioMixer, None, Some(addr("10.0.0.1:40000")))
        .set_connection_secret(secret);

    let ping = Ping {
        sender_uuid: agent_uuid,
        timestamp_micros: 1234,
    };
    agent.write_datagram(&ping, &mixer_uuid).await.expect("send ping");

    let (datagram, from) = recv(&mixer).await;
    let view = mixer.verify_packet(&datagram, from).expect("ping verifies");
    assert_eq!(view.packet_type, PacketType::Ping);
    let received = Ping::from_payload(view.payload).expect("decode");
    assert_eq!(received, ping);

    let reply = PingReply {
        sender_uuid: mixer_uuid,
        ping_timestamp_micros: received.timestamp_micros,
    };
    mixer.write_datagram(&reply, &agent_uuid).await.expect("send reply");

    let (datagram, from) = recv(&agent).await;
    let view = agent.verify_packet(&datagram, from).expect("reply verifies");
    assert_eq!(
        PingReply::from_payload(view.payload).expect("decode").ping_timestamp_micros,
        1234
    );
}

#[tokio::test]
async fn test_wrong_secret_is_dropped() {
    let network = MemoryNetwork::new();
    let clock = ManualTimeProvider::new();
    let mut mixer = bind(&network, &clock, "10.0.0.1:40000", 1).await;
    let mut intruder = bind(&network, &clock, "10.0.0.3:40000", 3).await;

    let claimed = Uuid::from_u128(42);
    mixer
        .add_or_update_node(claimed, NodeType::Agent, None, None)
        .set_connection_secret(Uuid::from_u128(1));
    intruder
        .add_or_update_node(
            mixer.session_uuid(),
            NodeType::AudioMixer,
            None,
            Some(addr("10.0.0.1:40000")),
        )
        .set_connection_secret(Uuid::from_u128(2));

    let ping = Ping {
        sender_uuid: claimed,
        timestamp_micros: 0,
    };
    intruder
        .write_datagram(&ping, &mixer.session_uuid())
        .await
        .expect("send");

    let (datagram, from) = recv(&mixer).await;
    assert!(mixer.verify_packet(&datagram, from).is_none());
    assert_eq!(
        mixer.node_with_uuid(&claimed).and_then(|n| n.pinned_socket()),
        None
    );
}

#[tokio::test]
async fn test_ice_punch_pins_first_replying_socket() {
    let network = MemoryNetwork::new();
    let clock = ManualTimeProvider::new();
    let coordinator = bind(&network, &clock, "198.51.100.7:40102", 1).await;
    // the candidate only answers on its local socket; its public one is unbound
    let mut candidate = bind(&network, &clock, "192.168.7.2:40000", 2).await;

    let mut peers = IcePeers::default();
    peers.add_candidate(&IcePeerDescriptor {
        uuid: candidate.session_uuid(),
        public_socket: Some(addr("203.0.113.2:40000")),
        local_socket: Some(addr("192.168.7.2:40000")),
    });

    assert_eq!(coordinator.ping_ice_peers(&mut peers).await.expect("sweep"), 2);

    let (datagram, from) = recv(&candidate).await;
    let view = candidate.verify_packet(&datagram, from).expect("exempt");
    assert_eq!(view.packet_type, PacketType::IcePing);
    candidate.answer_ice_ping(from).await.expect("reply");

    let (datagram, from) = recv(&coordinator).await;
    let view = PacketView::parse(&datagram).expect("parse");
    let reply = IcePingReply::from_payload(view.payload).expect("decode");
    assert_eq!(
        peers.handle_ping_reply(&reply.sender_uuid, from),
        Some(addr("192.168.7.2:40000"))
    );
    assert!(peers.connected_peer(&candidate.session_uuid()).is_some());
    assert_eq!(network.lost(), 1);
}
