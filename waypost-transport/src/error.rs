//! Error types for node table operations.

use std::io;

use uuid::Uuid;

use crate::wire::WireError;

/// Errors from [`LimitedNodeList`](crate::LimitedNodeList) operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeListError {
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Envelope could not be built.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// No node with this UUID.
    #[error("unknown node {0}")]
    UnknownNode(Uuid),

    /// The node has no socket to send to.
    #[error("node {0} has no active socket")]
    NoActiveSocket(Uuid),

    /// STUN was requested without a STUN server.
    #[error("no STUN server configured")]
    NoStunServer,
}
