//! Type tags carried on the wire.
//!
//! [`NodeType`] identifies what a tracked peer is; [`AssignmentType`]
//! identifies what job an assignment describes. Each concrete assignment type
//! belongs to exactly one node type family, see
//! [`AssignmentType::node_type`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error converting a byte or a name into a type tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeTagError {
    /// Unknown wire byte.
    #[error("unknown type tag byte {0:#04x}")]
    UnknownByte(u8),
    /// Unknown textual name.
    #[error("unknown type name `{0}`")]
    UnknownName(String),
}

/// Kind of node tracked in a node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    /// The domain coordinator itself.
    DomainServer,
    /// Voxel server.
    VoxelServer,
    /// Entity server.
    EntityServer,
    /// Metavoxel server.
    MetavoxelServer,
    /// A user client or a scripted agent.
    Agent,
    /// Audio mixer.
    AudioMixer,
    /// Avatar mixer.
    AvatarMixer,
    /// A worker that has not been handed an assignment yet.
    Unassigned,
}

impl NodeType {
    /// All node types, in wire-byte order of declaration.
    pub const ALL: [NodeType; 8] = [
        NodeType::DomainServer,
        NodeType::VoxelServer,
        NodeType::EntityServer,
        NodeType::MetavoxelServer,
        NodeType::Agent,
        NodeType::AudioMixer,
        NodeType::AvatarMixer,
        NodeType::Unassigned,
    ];

    /// Wire byte for this node type.
    pub const fn as_u8(self) -> u8 {
        match self {
            NodeType::DomainServer => b'D',
            NodeType::VoxelServer => b'V',
            NodeType::EntityServer => b'o',
            NodeType::MetavoxelServer => b'm',
            NodeType::Agent => b'I',
            NodeType::AudioMixer => b'M',
            NodeType::AvatarMixer => b'W',
            NodeType::Unassigned => 1,
        }
    }

    /// Node types that only ever join through a deployed assignment.
    ///
    /// `Agent` is excluded: user clients connect as agents without one.
    pub fn is_statically_assigned(self) -> bool {
        matches!(
            self,
            NodeType::VoxelServer
                | NodeType::EntityServer
                | NodeType::MetavoxelServer
                | NodeType::AudioMixer
                | NodeType::AvatarMixer
        )
    }
}

impl TryFrom<u8> for NodeType {
    type Error = TypeTagError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        NodeType::ALL
            .into_iter()
            .find(|t| t.as_u8() == byte)
            .ok_or(TypeTagError::UnknownByte(byte))
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::DomainServer => "domain-server",
            NodeType::VoxelServer => "voxel-server",
            NodeType::EntityServer => "entity-server",
            NodeType::MetavoxelServer => "metavoxel-server",
            NodeType::Agent => "agent",
            NodeType::AudioMixer => "audio-mixer",
            NodeType::AvatarMixer => "avatar-mixer",
            NodeType::Unassigned => "unassigned",
        };
        f.write_str(name)
    }
}

/// Kind of job an assignment describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentType {
    /// Audio mixer.
    AudioMixer = 0,
    /// Avatar mixer.
    AvatarMixer = 1,
    /// Scripted agent.
    Agent = 2,
    /// Voxel server.
    VoxelServer = 3,
    /// Entity server.
    EntityServer = 4,
    /// Metavoxel server.
    MetavoxelServer = 5,
    /// Wildcard used by workers willing to run anything.
    #[serde(rename = "all")]
    AllTypes = 6,
}

impl AssignmentType {
    /// Every concrete (non-wildcard) assignment type.
    pub const CONCRETE: [AssignmentType; 6] = [
        AssignmentType::AudioMixer,
        AssignmentType::AvatarMixer,
        AssignmentType::Agent,
        AssignmentType::VoxelServer,
        AssignmentType::EntityServer,
        AssignmentType::MetavoxelServer,
    ];

    /// Wire byte for this assignment type.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// The node type a worker becomes when it runs this assignment.
    ///
    /// `None` for the `AllTypes` wildcard.
    pub const fn node_type(self) -> Option<NodeType> {
        match self {
            AssignmentType::AudioMixer => Some(NodeType::AudioMixer),
            AssignmentType::AvatarMixer => Some(NodeType::AvatarMixer),
            AssignmentType::Agent => Some(NodeType::Agent),
            AssignmentType::VoxelServer => Some(NodeType::VoxelServer),
            AssignmentType::EntityServer => Some(NodeType::EntityServer),
            AssignmentType::MetavoxelServer => Some(NodeType::MetavoxelServer),
            AssignmentType::AllTypes => None,
        }
    }

    /// Types created only on demand, never as an implicit default instance.
    pub const fn is_on_demand(self) -> bool {
        matches!(self, AssignmentType::Agent)
    }

    fn name(self) -> &'static str {
        match self {
            AssignmentType::AudioMixer => "audio-mixer",
            AssignmentType::AvatarMixer => "avatar-mixer",
            AssignmentType::Agent => "agent",
            AssignmentType::VoxelServer => "voxel-server",
            AssignmentType::EntityServer => "entity-server",
            AssignmentType::MetavoxelServer => "metavoxel-server",
            AssignmentType::AllTypes => "all",
        }
    }
}

impl TryFrom<u8> for AssignmentType {
    type Error = TypeTagError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(AssignmentType::AudioMixer),
            1 => Ok(AssignmentType::AvatarMixer),
            2 => Ok(AssignmentType::Agent),
            3 => Ok(AssignmentType::VoxelServer),
            4 => Ok(AssignmentType::EntityServer),
            5 => Ok(AssignmentType::MetavoxelServer),
            6 => Ok(AssignmentType::AllTypes),
            other => Err(TypeTagError::UnknownByte(other)),
        }
    }
}

impl FromStr for AssignmentType {
    type Err = TypeTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(byte) = s.parse::<u8>() {
            return AssignmentType::try_from(byte);
        }
        AssignmentType::CONCRETE
            .into_iter()
            .chain([AssignmentType::AllTypes])
            .find(|t| t.name() == s)
            .ok_or_else(|| TypeTagError::UnknownName(s.to_string()))
    }
}

impl fmt::Display for AssignmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_bytes_are_unique() {
        for a in NodeType::ALL {
            assert_eq!(NodeType::try_from(a.as_u8()), Ok(a));
            for b in NodeType::ALL {
                if a != b {
                    assert_ne!(a.as_u8(), b.as_u8());
                }
            }
        }
        assert!(NodeType::try_from(b'?').is_err());
    }

    #[test]
    fn test_assignment_type_families() {
        assert_eq!(AssignmentType::Agent.node_type(), Some(NodeType::Agent));
        assert_eq!(
            AssignmentType::VoxelServer.node_type(),
            Some(NodeType::VoxelServer)
        );
        assert_eq!(AssignmentType::AllTypes.node_type(), None);
    }

    #[test]
    fn test_statically_assigned_excludes_agents() {
        assert!(!NodeType::Agent.is_statically_assigned());
        assert!(!NodeType::Unassigned.is_statically_assigned());
        assert!(NodeType::AudioMixer.is_statically_assigned());
    }

    #[test]
    fn test_assignment_type_parse() {
        assert_eq!("agent".parse(), Ok(AssignmentType::Agent));
        assert_eq!("3".parse(), Ok(AssignmentType::VoxelServer));
        assert_eq!("all".parse(), Ok(AssignmentType::AllTypes));
        assert!("juggler".parse::<AssignmentType>().is_err());
    }

    #[test]
    fn test_assignment_type_serde_names() {
        let json = serde_json::to_string(&AssignmentType::AvatarMixer).expect("serialize");
        assert_eq!(json, "\"avatar-mixer\"");
        let decoded: AssignmentType = serde_json::from_str("\"entity-server\"").expect("decode");
        assert_eq!(decoded, AssignmentType::EntityServer);
    }

    #[test]
    fn test_serde_names_match_display() {
        for assignment_type in AssignmentType::CONCRETE
            .into_iter()
            .chain([AssignmentType::AllTypes])
        {
            let json = serde_json::to_string(&assignment_type).expect("serialize");
            assert_eq!(json, format!("\"{assignment_type}\""));
            let parsed: AssignmentType = assignment_type.to_string().parse().expect("parse");
            assert_eq!(parsed, assignment_type);
        }
        let wildcard: AssignmentType = serde_json::from_str("\"all\"").expect("decode");
        assert_eq!(wildcard, AssignmentType::AllTypes);
    }
}
