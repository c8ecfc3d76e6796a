//! # Waypost Transport Layer
//!
//! Secure UDP transport shared by the domain coordinator and the workers.
//!
//! This crate provides:
//! - **Wire format**: `[type][version][hash][payload]` envelope with
//!   MD5(payload ‖ secret) verification
//! - **Protocol**: typed messages for assignments, the connect handshake,
//!   check-ins, peer pings and ICE rendezvous
//! - **Node table**: [`LimitedNodeList`], the UUID-keyed table of peers plus
//!   the socket they are reached through, with silence-based eviction
//! - **NAT traversal**: STUN public-address discovery and the ICE candidate
//!   table

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use waypost_core::{
    AssignmentType, DatagramSocket, NetworkProvider, NodeType, Providers, RandomProvider,
    TimeProvider, Uuid,
};

// =============================================================================
// Modules
// =============================================================================

/// Payload encoding primitives.
pub mod codec;

/// Error types for node table operations.
pub mod error;

/// ICE candidate table and hole punching.
pub mod ice;

/// Tracked peers and their linked data.
pub mod node;

/// The node table.
pub mod node_list;

/// Typed protocol messages.
pub mod protocol;

/// STUN binding request and response handling.
pub mod stun;

/// Log rate limiting.
pub mod throttle;

/// Packet envelope and hash verification.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use codec::{CodecError, PacketReader, PacketWriter};
pub use error::NodeListError;
pub use ice::{
    ICE_HEARTBEAT_INTERVAL, ICE_PING_INTERVAL, IcePeers, MAX_ICE_CONNECTION_ATTEMPTS, NetworkPeer,
    PeerState,
};
pub use node::{DomainNodeData, Node, NodeData, PeerNodeData};
pub use node_list::{
    LimitedNodeList, NODE_SILENCE_THRESHOLD, NodeListConfig, NodeListEvent,
    SILENT_NODE_SWEEP_INTERVAL, STUN_REFRESH_INTERVAL,
};
pub use protocol::Packet;
pub use stun::StunError;
pub use throttle::LogThrottle;
pub use wire::{
    HASH_SIZE, MAX_PACKET_SIZE, PacketType, PacketView, WireError, hash_for_packet, write_packet,
};
