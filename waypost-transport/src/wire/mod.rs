//! Packet envelope and hash verification.
//!
//! Envelope format: `[type:1][version:1][hash:16][payload:N]`
//!
//! - **type**: [`PacketType`] byte
//! - **version**: per-type protocol version, see [`PacketType::version`]
//! - **hash**: `MD5(payload ‖ connection secret)`, present only for verified
//!   types ([`PacketType::is_verified`])
//! - **payload**: type-specific body. Verified payloads lead with the
//!   sender's 16-byte node UUID, which is how the receiver finds the secret.
//!
//! Version and hash are checked before any non-exempt processing. A mismatch
//! is a silent drop: nothing is ever sent back for a bad datagram.

use md5::{Digest, Md5};
use uuid::Uuid;

/// Size of the packet hash.
pub const HASH_SIZE: usize = 16;

/// Size of type + version.
pub const BASE_HEADER_SIZE: usize = 2;

/// Largest datagram either side will send.
pub const MAX_PACKET_SIZE: usize = 1450;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the envelope.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// The type byte is not a known packet type.
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),

    /// Version byte does not match what this build speaks.
    #[error("version mismatch for {packet_type:?}: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Packet type from the envelope.
        packet_type: PacketType,
        /// Version this build speaks.
        expected: u8,
        /// Version found in the envelope.
        actual: u8,
    },

    /// Header hash does not match the recomputed hash.
    #[error("hash mismatch for {0:?}")]
    HashMismatch(PacketType),

    /// A verified packet did not carry a sender UUID.
    #[error("verified {0:?} packet has no sender UUID")]
    MissingSender(PacketType),

    /// Packet exceeds the maximum datagram size.
    #[error("packet too large: {size} bytes (max {MAX_PACKET_SIZE})")]
    PacketTooLarge {
        /// Actual packet size in bytes.
        size: usize,
    },
}

/// Every packet type spoken between coordinator, workers, clients and the ICE server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Worker asks for a job.
    RequestAssignment = 1,
    /// Coordinator hands out a job (or a client asks for a dynamic one).
    CreateAssignment = 2,
    /// First handshake of a node with the coordinator.
    DomainConnectRequest = 3,
    /// Coordinator reply: requester UUID + peers with pairwise secrets.
    DomainList = 4,
    /// Periodic check-in of an admitted node.
    DomainListRequest = 5,
    /// Explicit policy rejection.
    DomainConnectionDenied = 6,
    /// Coordinator tells nodes a peer is gone.
    DomainServerRemovedNode = 7,
    /// Heartbeat to the ICE server.
    IceServerHeartbeat = 8,
    /// ICE server's list of candidate peers.
    IceServerHeartbeatResponse = 9,
    /// Hole-punching ping.
    IcePing = 10,
    /// Hole-punching ping reply.
    IcePingReply = 11,
    /// Authenticated peer ping.
    Ping = 12,
    /// Authenticated peer ping reply.
    PingReply = 13,
}

impl PacketType {
    /// Decode a type byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        use PacketType::*;
        [
            RequestAssignment,
            CreateAssignment,
            DomainConnectRequest,
            DomainList,
            DomainListRequest,
            DomainConnectionDenied,
            DomainServerRemovedNode,
            IceServerHeartbeat,
            IceServerHeartbeatResponse,
            IcePing,
            IcePingReply,
            Ping,
            PingReply,
        ]
        .into_iter()
        .find(|t| *t as u8 == byte)
    }

    /// Protocol version of this packet type.
    pub const fn version(self) -> u8 {
        match self {
            PacketType::CreateAssignment | PacketType::RequestAssignment => 2,
            PacketType::DomainConnectRequest | PacketType::DomainList => 3,
            _ => 1,
        }
    }

    /// Whether the envelope carries a hash that must verify.
    pub const fn is_verified(self) -> bool {
        matches!(
            self,
            PacketType::DomainListRequest | PacketType::Ping | PacketType::PingReply
        )
    }

    /// Envelope size before the payload.
    pub const fn header_size(self) -> usize {
        if self.is_verified() {
            BASE_HEADER_SIZE + HASH_SIZE
        } else {
            BASE_HEADER_SIZE
        }
    }
}

/// `MD5(payload ‖ secret)`.
pub fn hash_for_packet(payload: &[u8], secret: &Uuid) -> [u8; HASH_SIZE] {
    let mut hasher = Md5::new();
    hasher.update(payload);
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Build a datagram.
///
/// For verified types the hash is computed with `secret`; without a secret
/// the hash field is zeroed and the receiver will drop the packet. For
/// exempt types `secret` is ignored and no hash is written.
///
/// # Errors
///
/// Returns `PacketTooLarge` if the datagram would exceed [`MAX_PACKET_SIZE`].
pub fn write_packet(
    packet_type: PacketType,
    payload: &[u8],
    secret: Option<&Uuid>,
) -> Result<Vec<u8>, WireError> {
    let size = packet_type.header_size() + payload.len();
    if size > MAX_PACKET_SIZE {
        return Err(WireError::PacketTooLarge { size });
    }

    let mut data = Vec::with_capacity(size);
    data.push(packet_type as u8);
    data.push(packet_type.version());
    if packet_type.is_verified() {
        let hash = secret
            .map(|secret| hash_for_packet(payload, secret))
            .unwrap_or([0u8; HASH_SIZE]);
        data.extend_from_slice(&hash);
    }
    data.extend_from_slice(payload);
    Ok(data)
}

/// Parsed, version-checked view over a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketView<'a> {
    /// Packet type.
    pub packet_type: PacketType,
    /// Header hash, for verified types.
    pub hash: Option<[u8; HASH_SIZE]>,
    /// Payload after the envelope.
    pub payload: &'a [u8],
}

impl<'a> PacketView<'a> {
    /// Parse the envelope and check the version byte.
    ///
    /// The hash is *not* checked here; see [`verify`](Self::verify).
    ///
    /// # Errors
    ///
    /// - `InsufficientData` if the envelope is truncated
    /// - `UnknownType` for an unknown type byte
    /// - `VersionMismatch` if the version byte differs
    pub fn parse(datagram: &'a [u8]) -> Result<Self, WireError> {
        if datagram.len() < BASE_HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: BASE_HEADER_SIZE,
                have: datagram.len(),
            });
        }
        let packet_type =
            PacketType::from_u8(datagram[0]).ok_or(WireError::UnknownType(datagram[0]))?;
        let version = datagram[1];
        if version != packet_type.version() {
            return Err(WireError::VersionMismatch {
                packet_type,
                expected: packet_type.version(),
                actual: version,
            });
        }

        let header_size = packet_type.header_size();
        if datagram.len() < header_size {
            return Err(WireError::InsufficientData {
                needed: header_size,
                have: datagram.len(),
            });
        }

        let hash = if packet_type.is_verified() {
            let mut hash = [0u8; HASH_SIZE];
            hash.copy_from_slice(&datagram[BASE_HEADER_SIZE..header_size]);
            Some(hash)
        } else {
            None
        };

        Ok(Self {
            packet_type,
            hash,
            payload: &datagram[header_size..],
        })
    }

    /// The sender UUID leading a verified payload.
    pub fn sender_uuid(&self) -> Option<Uuid> {
        if !self.packet_type.is_verified() || self.payload.len() < 16 {
            return None;
        }
        Uuid::from_slice(&self.payload[..16]).ok()
    }

    /// Check the header hash against `MD5(payload ‖ secret)`.
    ///
    /// Exempt types always pass.
    pub fn verify(&self, secret: &Uuid) -> Result<(), WireError> {
        match self.hash {
            None => Ok(()),
            Some(hash) if hash == hash_for_packet(self.payload, secret) => Ok(()),
            Some(_) => Err(WireError::HashMismatch(self.packet_type)),
        }
    }
}
