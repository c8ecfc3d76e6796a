//! Typed protocol messages.
//!
//! Each message knows its [`PacketType`] and how to write and read its
//! payload. The envelope (type, version, hash) is added by
//! [`crate::wire::write_packet`].

mod assignment;
mod domain;
mod ice;
mod ping;

pub use assignment::{Assignment, RequestAssignment};
pub use domain::{
    DomainConnectRequest, DomainConnectionDenied, DomainList, DomainListRequest,
    DomainServerRemovedNode, NodeDescriptor,
};
pub use ice::{
    IcePeerDescriptor, IcePing, IcePingReply, IceServerHeartbeat, IceServerHeartbeatResponse,
};
pub use ping::{Ping, PingReply};

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::wire::PacketType;

/// A message with a fixed packet type and a payload codec.
pub trait Packet: Sized {
    /// Packet type carried in the envelope.
    const TYPE: PacketType;

    /// Append the payload.
    fn write_payload(&self, writer: &mut PacketWriter);

    /// Decode the payload.
    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError>;

    /// Encode to a standalone payload.
    fn to_payload(&self) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        self.write_payload(&mut writer);
        writer.into_vec()
    }

    /// Decode a standalone payload.
    fn from_payload(payload: &[u8]) -> Result<Self, CodecError> {
        Self::read_payload(&mut PacketReader::new(payload))
    }
}
