//! Read-only JSON snapshots of the registries for the admin surface.

use std::net::SocketAddr;

use serde::Serialize;
use uuid::Uuid;
use waypost_core::{AssignmentType, NodeType};
use waypost_transport::Node;
use waypost_transport::protocol::Assignment;

/// One admitted node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeView {
    /// Node UUID.
    pub uuid: Uuid,
    /// Node type.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Public socket.
    pub public_socket: Option<SocketAddr>,
    /// Local socket.
    pub local_socket: Option<SocketAddr>,
    /// Assignment the node fulfils.
    pub assignment_uuid: Option<Uuid>,
    /// Wallet credited.
    pub wallet_uuid: Option<Uuid>,
    /// Authenticated username.
    pub username: Option<String>,
    /// Milliseconds since the node was last heard from.
    pub silent_ms: u64,
}

impl NodeView {
    pub(crate) fn new(node: &Node, now: std::time::Duration) -> Self {
        let data = node.domain_data();
        Self {
            uuid: node.uuid(),
            node_type: node.node_type(),
            public_socket: node.public_socket(),
            local_socket: node.local_socket(),
            assignment_uuid: data.and_then(|d| d.assignment_uuid),
            wallet_uuid: data.and_then(|d| d.wallet_uuid),
            username: data.and_then(|d| d.username.clone()),
            silent_ms: now.saturating_sub(node.last_heard()).as_millis() as u64,
        }
    }
}

/// One assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentView {
    /// Assignment UUID.
    pub uuid: Uuid,
    /// Assignment type.
    #[serde(rename = "type")]
    pub assignment_type: AssignmentType,
    /// Pool label.
    pub pool: String,
    /// Payload, lossily decoded as UTF-8.
    pub payload: String,
    /// Config-defined.
    pub is_static: bool,
}

impl From<&Assignment> for AssignmentView {
    fn from(assignment: &Assignment) -> Self {
        Self {
            uuid: assignment.uuid,
            assignment_type: assignment.assignment_type,
            pool: assignment.pool.clone(),
            payload: String::from_utf8_lossy(&assignment.payload).into_owned(),
            is_static: assignment.is_static,
        }
    }
}

/// Queue and static set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentsView {
    /// Waiting for a worker, head first.
    pub queued: Vec<AssignmentView>,
    /// Every static assignment, sorted by type then UUID.
    pub static_assignments: Vec<AssignmentView>,
}
