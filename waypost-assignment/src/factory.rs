//! Assignment type tag → workload.

use waypost_core::{AssignmentType, NodeType};
use waypost_transport::protocol::Assignment;

/// The job a worker runs for the duration of one assignment.
///
/// The per-type work itself is opaque here; a workload fixes the node type
/// the worker announces and the peers it wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workload {
    /// Audio mixer.
    AudioMixer,
    /// Avatar mixer.
    AvatarMixer,
    /// Scripted agent. An empty script means "use the persisted one".
    Agent {
        /// Script source or URL.
        script: String,
    },
    /// Voxel server.
    VoxelServer,
    /// Entity server.
    EntityServer,
    /// Metavoxel server.
    MetavoxelServer,
}

impl Workload {
    /// Build the workload for a received assignment.
    ///
    /// `None` for the `AllTypes` wildcard and for an agent whose script is
    /// not UTF-8; the caller keeps polling.
    pub fn from_assignment(assignment: &Assignment) -> Option<Self> {
        let workload = match assignment.assignment_type {
            AssignmentType::AudioMixer => Workload::AudioMixer,
            AssignmentType::AvatarMixer => Workload::AvatarMixer,
            AssignmentType::Agent => Workload::Agent {
                script: String::from_utf8(assignment.payload.clone()).ok()?,
            },
            AssignmentType::VoxelServer => Workload::VoxelServer,
            AssignmentType::EntityServer => Workload::EntityServer,
            AssignmentType::MetavoxelServer => Workload::MetavoxelServer,
            AssignmentType::AllTypes => return None,
        };
        Some(workload)
    }

    /// Assignment type this workload fulfils.
    pub fn assignment_type(&self) -> AssignmentType {
        match self {
            Workload::AudioMixer => AssignmentType::AudioMixer,
            Workload::AvatarMixer => AssignmentType::AvatarMixer,
            Workload::Agent { .. } => AssignmentType::Agent,
            Workload::VoxelServer => AssignmentType::VoxelServer,
            Workload::EntityServer => AssignmentType::EntityServer,
            Workload::MetavoxelServer => AssignmentType::MetavoxelServer,
        }
    }

    /// Node type announced in the connect request.
    pub fn node_type(&self) -> NodeType {
        match self {
            Workload::AudioMixer => NodeType::AudioMixer,
            Workload::AvatarMixer => NodeType::AvatarMixer,
            Workload::Agent { .. } => NodeType::Agent,
            Workload::VoxelServer => NodeType::VoxelServer,
            Workload::EntityServer => NodeType::EntityServer,
            Workload::MetavoxelServer => NodeType::MetavoxelServer,
        }
    }

    /// Node types this workload wants in its peer list.
    pub fn interests(&self) -> &'static [NodeType] {
        match self {
            Workload::AudioMixer | Workload::AvatarMixer | Workload::MetavoxelServer => {
                &[NodeType::Agent]
            }
            Workload::Agent { .. } => &[
                NodeType::AudioMixer,
                NodeType::AvatarMixer,
                NodeType::VoxelServer,
                NodeType::EntityServer,
                NodeType::MetavoxelServer,
            ],
            Workload::VoxelServer | Workload::EntityServer => &[],
        }
    }
}
