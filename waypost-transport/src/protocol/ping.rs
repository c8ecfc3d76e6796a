//! Hash-verified peer pings.

use uuid::Uuid;

use super::Packet;
use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::wire::PacketType;

/// Authenticated liveness probe between two admitted peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Pinging node.
    pub sender_uuid: Uuid,
    /// Sender clock at send time, in microseconds.
    pub timestamp_micros: u64,
}

impl Packet for Ping {
    const TYPE: PacketType = PacketType::Ping;

    fn write_payload(&self, writer: &mut PacketWriter) {
        writer.put_uuid(&self.sender_uuid).put_u64(self.timestamp_micros);
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            sender_uuid: reader.uuid()?,
            timestamp_micros: reader.u64()?,
        })
    }
}

/// Reply to a [`Ping`], echoing its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReply {
    /// Replying node.
    pub sender_uuid: Uuid,
    /// Timestamp copied from the ping.
    pub ping_timestamp_micros: u64,
}

impl Packet for PingReply {
    const TYPE: PacketType = PacketType::PingReply;

    fn write_payload(&self, writer: &mut PacketWriter) {
        writer
            .put_uuid(&self.sender_uuid)
            .put_u64(self.ping_timestamp_micros);
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            sender_uuid: reader.uuid()?,
            ping_timestamp_micros: reader.u64()?,
        })
    }
}
