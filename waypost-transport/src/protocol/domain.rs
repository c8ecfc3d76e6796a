//! Coordinator handshake and membership messages.

use std::net::SocketAddr;

use uuid::Uuid;
use waypost_core::NodeType;

use super::Packet;
use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::wire::{MAX_PACKET_SIZE, PacketType};

/// First handshake of a node with the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConnectRequest {
    /// What the node is.
    pub node_type: NodeType,
    /// Deploy UUID for assigned workers, `None` for ordinary clients.
    pub inbound_uuid: Option<Uuid>,
    /// Public socket as the node knows it; `None` if unknown.
    pub public_socket: Option<SocketAddr>,
    /// Local socket.
    pub local_socket: Option<SocketAddr>,
    /// Node types this node wants in its peer list.
    pub interests: Vec<NodeType>,
    /// Username, empty when anonymous.
    pub username: String,
    /// RSA signature over the username bytes.
    pub username_signature: Vec<u8>,
}

impl Packet for DomainConnectRequest {
    const TYPE: PacketType = PacketType::DomainConnectRequest;

    fn write_payload(&self, writer: &mut PacketWriter) {
        writer
            .put_node_type(self.node_type)
            .put_optional_uuid(self.inbound_uuid.as_ref())
            .put_socket(self.public_socket)
            .put_socket(self.local_socket)
            .put_node_types(&self.interests)
            .put_string(&self.username)
            .put_blob(&self.username_signature);
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            node_type: reader.node_type()?,
            inbound_uuid: reader.optional_uuid()?,
            public_socket: reader.socket()?,
            local_socket: reader.socket()?,
            interests: reader.node_types()?,
            username: reader.string()?,
            username_signature: reader.blob()?,
        })
    }
}

/// One peer entry in a [`DomainList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Peer type.
    pub node_type: NodeType,
    /// Peer UUID.
    pub uuid: Uuid,
    /// Peer public socket.
    pub public_socket: Option<SocketAddr>,
    /// Peer local socket.
    pub local_socket: Option<SocketAddr>,
    /// Pairwise secret shared by the requester and this peer.
    pub connection_secret: Uuid,
}

impl NodeDescriptor {
    fn write(&self, writer: &mut PacketWriter) {
        writer
            .put_node_type(self.node_type)
            .put_uuid(&self.uuid)
            .put_socket(self.public_socket)
            .put_socket(self.local_socket)
            .put_uuid(&self.connection_secret);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            node_type: reader.node_type()?,
            uuid: reader.uuid()?,
            public_socket: reader.socket()?,
            local_socket: reader.socket()?,
            connection_secret: reader.uuid()?,
        })
    }
}

/// Coordinator reply to a connect request or a check-in.
///
/// Large peer lists are split with [`DomainList::chunk_payloads`]; every
/// chunk repeats the header so each datagram stands alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainList {
    /// UUID the coordinator assigned to the requester.
    pub node_uuid: Uuid,
    /// Secret shared by the requester and the coordinator.
    pub connection_secret: Uuid,
    /// Peers matching the requester's interests.
    pub nodes: Vec<NodeDescriptor>,
}

impl DomainList {
    fn write_header(&self, writer: &mut PacketWriter) {
        writer.put_uuid(&self.node_uuid).put_uuid(&self.connection_secret);
    }

    /// Encode into payloads that each fit in one datagram.
    ///
    /// Always yields at least one payload, even with no peers.
    pub fn chunk_payloads(&self) -> Vec<Vec<u8>> {
        let budget = MAX_PACKET_SIZE - PacketType::DomainList.header_size();
        let mut payloads = Vec::new();

        let mut entries: Vec<Vec<u8>> = Vec::new();
        let mut size = 0;
        let header_size = {
            let mut header = PacketWriter::new();
            self.write_header(&mut header);
            header.len() + 2
        };

        let flush = |entries: &mut Vec<Vec<u8>>, payloads: &mut Vec<Vec<u8>>| {
            let mut chunk = PacketWriter::new();
            self.write_header(&mut chunk);
            chunk.put_u16(entries.len() as u16);
            for entry in entries.drain(..) {
                chunk.put_raw(&entry);
            }
            payloads.push(chunk.into_vec());
        };

        for node in &self.nodes {
            let mut entry = PacketWriter::new();
            node.write(&mut entry);
            let entry = entry.into_vec();
            if !entries.is_empty() && header_size + size + entry.len() > budget {
                flush(&mut entries, &mut payloads);
                size = 0;
            }
            size += entry.len();
            entries.push(entry);
        }
        if !entries.is_empty() || payloads.is_empty() {
            flush(&mut entries, &mut payloads);
        }
        payloads
    }
}

impl Packet for DomainList {
    const TYPE: PacketType = PacketType::DomainList;

    fn write_payload(&self, writer: &mut PacketWriter) {
        self.write_header(writer);
        writer.put_u16(self.nodes.len().min(u16::MAX as usize) as u16);
        for node in self.nodes.iter().take(u16::MAX as usize) {
            node.write(writer);
        }
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let node_uuid = reader.uuid()?;
        let connection_secret = reader.uuid()?;
        let count = reader.u16()?;
        let nodes = (0..count)
            .map(|_| NodeDescriptor::read(reader))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            node_uuid,
            connection_secret,
            nodes,
        })
    }
}

/// Periodic, hash-verified check-in of an admitted node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainListRequest {
    /// The checking-in node.
    pub sender_uuid: Uuid,
    /// Its type.
    pub node_type: NodeType,
    /// Current public socket.
    pub public_socket: Option<SocketAddr>,
    /// Current local socket.
    pub local_socket: Option<SocketAddr>,
    /// Node types it wants in its peer list.
    pub interests: Vec<NodeType>,
}

impl Packet for DomainListRequest {
    const TYPE: PacketType = PacketType::DomainListRequest;

    fn write_payload(&self, writer: &mut PacketWriter) {
        writer
            .put_uuid(&self.sender_uuid)
            .put_node_type(self.node_type)
            .put_socket(self.public_socket)
            .put_socket(self.local_socket)
            .put_node_types(&self.interests);
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            sender_uuid: reader.uuid()?,
            node_type: reader.node_type()?,
            public_socket: reader.socket()?,
            local_socket: reader.socket()?,
            interests: reader.node_types()?,
        })
    }
}

/// Explicit policy rejection of a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConnectionDenied {
    /// Human-readable reason.
    pub reason: String,
}

impl Packet for DomainConnectionDenied {
    const TYPE: PacketType = PacketType::DomainConnectionDenied;

    fn write_payload(&self, writer: &mut PacketWriter) {
        writer.put_string(&self.reason);
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            reason: reader.string()?,
        })
    }
}

/// Coordinator notice that a node was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainServerRemovedNode {
    /// The removed node.
    pub uuid: Uuid,
}

impl Packet for DomainServerRemovedNode {
    const TYPE: PacketType = PacketType::DomainServerRemovedNode;

    fn write_payload(&self, writer: &mut PacketWriter) {
        writer.put_uuid(&self.uuid);
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self { uuid: reader.uuid()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(n: u128) -> NodeDescriptor {
        NodeDescriptor {
            node_type: NodeType::AudioMixer,
            uuid: Uuid::from_u128(n),
            public_socket: Some("[2001:db8::1]:40000".parse().expect("addr")),
            local_socket: Some("[fd00::1]:40000".parse().expect("addr")),
            connection_secret: Uuid::from_u128(n + 1_000),
        }
    }

    #[test]
    fn test_connect_request_payload() {
        let request = DomainConnectRequest {
            node_type: NodeType::Agent,
            inbound_uuid: Some(Uuid::from_u128(3)),
            public_socket: None,
            local_socket: Some("10.0.0.4:5000".parse().expect("addr")),
            interests: vec![NodeType::AudioMixer, NodeType::AvatarMixer],
            username: "alice".into(),
            username_signature: vec![1, 2, 3],
        };
        let decoded = DomainConnectRequest::from_payload(&request.to_payload()).expect("decode");
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_empty_domain_list_is_one_chunk() {
        let list = DomainList {
            node_uuid: Uuid::from_u128(1),
            connection_secret: Uuid::from_u128(2),
            nodes: Vec::new(),
        };
        let chunks = list.chunk_payloads();
        assert_eq!(chunks.len(), 1);
        assert_eq!(DomainList::from_payload(&chunks[0]).expect("decode"), list);
    }

    #[test]
    fn test_large_domain_list_splits_under_mtu() {
        let nodes: Vec<_> = (0..100).map(descriptor).collect();
        let list = DomainList {
            node_uuid: Uuid::from_u128(1),
            connection_secret: Uuid::from_u128(2),
            nodes: nodes.clone(),
        };

        let chunks = list.chunk_payloads();
        assert!(chunks.len() > 1);

        let mut seen = Vec::new();
        for chunk in &chunks {
            assert!(chunk.len() + PacketType::DomainList.header_size() <= MAX_PACKET_SIZE);
            let part = DomainList::from_payload(chunk).expect("decode");
            assert_eq!(part.node_uuid, list.node_uuid);
            assert_eq!(part.connection_secret, list.connection_secret);
            seen.extend(part.nodes);
        }
        assert_eq!(seen, nodes);
    }
}
