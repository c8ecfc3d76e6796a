//! ICE rendezvous messages.

use std::net::SocketAddr;

use uuid::Uuid;

use super::Packet;
use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::wire::PacketType;

/// Heartbeat sent to the ICE server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerHeartbeat {
    /// Identity announced to the ICE server.
    pub sender_uuid: Uuid,
    /// Own public socket.
    pub public_socket: Option<SocketAddr>,
    /// Own local socket.
    pub local_socket: Option<SocketAddr>,
    /// Peer this node wants to reach, if any.
    pub connection_request_id: Option<Uuid>,
}

impl Packet for IceServerHeartbeat {
    const TYPE: PacketType = PacketType::IceServerHeartbeat;

    fn write_payload(&self, writer: &mut PacketWriter) {
        writer
            .put_uuid(&self.sender_uuid)
            .put_socket(self.public_socket)
            .put_socket(self.local_socket)
            .put_optional_uuid(self.connection_request_id.as_ref());
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            sender_uuid: reader.uuid()?,
            public_socket: reader.socket()?,
            local_socket: reader.socket()?,
            connection_request_id: reader.optional_uuid()?,
        })
    }
}

/// Candidate peer announced by the ICE server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcePeerDescriptor {
    /// Peer identity.
    pub uuid: Uuid,
    /// Peer public socket.
    pub public_socket: Option<SocketAddr>,
    /// Peer local socket.
    pub local_socket: Option<SocketAddr>,
}

/// ICE server reply listing candidate peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerHeartbeatResponse {
    /// Candidates.
    pub peers: Vec<IcePeerDescriptor>,
}

impl Packet for IceServerHeartbeatResponse {
    const TYPE: PacketType = PacketType::IceServerHeartbeatResponse;

    fn write_payload(&self, writer: &mut PacketWriter) {
        writer.put_u16(self.peers.len().min(u16::MAX as usize) as u16);
        for peer in self.peers.iter().take(u16::MAX as usize) {
            writer
                .put_uuid(&peer.uuid)
                .put_socket(peer.public_socket)
                .put_socket(peer.local_socket);
        }
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let count = reader.u16()?;
        let peers = (0..count)
            .map(|_| {
                Ok(IcePeerDescriptor {
                    uuid: reader.uuid()?,
                    public_socket: reader.socket()?,
                    local_socket: reader.socket()?,
                })
            })
            .collect::<Result<_, CodecError>>()?;
        Ok(Self { peers })
    }
}

/// Unverified hole-punching ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcePing {
    /// Pinging node.
    pub sender_uuid: Uuid,
}

impl Packet for IcePing {
    const TYPE: PacketType = PacketType::IcePing;

    fn write_payload(&self, writer: &mut PacketWriter) {
        writer.put_uuid(&self.sender_uuid);
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            sender_uuid: reader.uuid()?,
        })
    }
}

/// Unverified reply to an [`IcePing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcePingReply {
    /// Replying node.
    pub sender_uuid: Uuid,
}

impl Packet for IcePingReply {
    const TYPE: PacketType = PacketType::IcePingReply;

    fn write_payload(&self, writer: &mut PacketWriter) {
        writer.put_uuid(&self.sender_uuid);
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            sender_uuid: reader.uuid()?,
        })
    }
}
