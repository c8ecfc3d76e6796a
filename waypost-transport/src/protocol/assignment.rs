//! Assignment descriptors and the worker's request for one.

use serde::Serialize;
use uuid::Uuid;
use waypost_core::AssignmentType;

use super::Packet;
use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::wire::PacketType;

/// Command byte leading every `CreateAssignment` payload.
///
/// Both directions carry a create: the coordinator handing a job to a worker,
/// and a client asking the coordinator to enqueue a dynamic job.
const CREATE_COMMAND: u8 = 0;

/// A job descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    /// Identity of this assignment instance.
    pub uuid: Uuid,
    /// Worker type.
    pub assignment_type: AssignmentType,
    /// Pool label, empty for the default pool.
    pub pool: String,
    /// Opaque type-specific payload (script URL, worker flags).
    pub payload: Vec<u8>,
    /// Wallet credited for the work, if any.
    pub wallet_uuid: Option<Uuid>,
    /// Config-defined and persistent.
    pub is_static: bool,
}

impl Assignment {
    /// A new assignment with no payload and no wallet.
    pub fn new(uuid: Uuid, assignment_type: AssignmentType, pool: impl Into<String>) -> Self {
        Self {
            uuid,
            assignment_type,
            pool: pool.into(),
            payload: Vec::new(),
            wallet_uuid: None,
            is_static: false,
        }
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set the static flag.
    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    /// Whether a request for `(assignment_type, pool)` may receive this one.
    ///
    /// Types must be equal unless the request is the `AllTypes` wildcard.
    /// Pools must be equal, which includes both being empty.
    pub fn matches_request(&self, assignment_type: AssignmentType, pool: &str) -> bool {
        (assignment_type == AssignmentType::AllTypes || assignment_type == self.assignment_type)
            && self.pool == pool
    }
}

impl Packet for Assignment {
    const TYPE: PacketType = PacketType::CreateAssignment;

    fn write_payload(&self, writer: &mut PacketWriter) {
        writer
            .put_u8(CREATE_COMMAND)
            .put_assignment_type(self.assignment_type)
            .put_uuid(&self.uuid)
            .put_string(&self.pool)
            .put_optional_uuid(self.wallet_uuid.as_ref())
            .put_bool(self.is_static)
            .put_blob(&self.payload);
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        if reader.u8()? != CREATE_COMMAND {
            return Err(CodecError::InvalidValue("assignment command"));
        }
        Ok(Self {
            assignment_type: reader.assignment_type()?,
            uuid: reader.uuid()?,
            pool: reader.string()?,
            wallet_uuid: reader.optional_uuid()?,
            is_static: reader.bool()?,
            payload: reader.blob()?,
        })
    }
}

/// A worker asking the coordinator for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAssignment {
    /// Type the worker is willing to run, or `AllTypes`.
    pub assignment_type: AssignmentType,
    /// Pool the worker serves.
    pub pool: String,
    /// Wallet to credit.
    pub wallet_uuid: Option<Uuid>,
}

impl Packet for RequestAssignment {
    const TYPE: PacketType = PacketType::RequestAssignment;

    fn write_payload(&self, writer: &mut PacketWriter) {
        writer
            .put_assignment_type(self.assignment_type)
            .put_string(&self.pool)
            .put_optional_uuid(self.wallet_uuid.as_ref());
    }

    fn read_payload(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            assignment_type: reader.assignment_type()?,
            pool: reader.string()?,
            wallet_uuid: reader.optional_uuid()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_assignment_payload() {
        let mut assignment = Assignment::new(Uuid::from_u128(5), AssignmentType::Agent, "numerics")
        .with_payload(b"http://scripts/bot.js".to_vec());
        assignment.wallet_uuid = Some(Uuid::from_u128(9));

        let decoded = Assignment::from_payload(&assignment.to_payload()).expect("decode");
        assert_eq!(decoded, assignment);
    }

    #[test]
    fn test_unknown_assignment_type_fails() {
        let mut payload = RequestAssignment {
            assignment_type: AssignmentType::Agent,
            pool: String::new(),
            wallet_uuid: None,
        }
        .to_payload();
        payload[0] = 42;
        assert!(RequestAssignment::from_payload(&payload).is_err());
    }

    #[test]
    fn test_only_create_commands_decode() {
        let mut payload =
            Assignment::new(Uuid::from_u128(5), AssignmentType::Agent, "").to_payload();
        assert_eq!(payload[0], CREATE_COMMAND);
        payload[0] = 1;
        assert!(matches!(
            Assignment::from_payload(&payload),
            Err(CodecError::InvalidValue("assignment command"))
        ));
    }

    #[test]
    fn test_match_rule() {
        let assignment = Assignment::new(Uuid::nil(), AssignmentType::AudioMixer, "");
        assert!(assignment.matches_request(AssignmentType::AudioMixer, ""));
        assert!(assignment.matches_request(AssignmentType::AllTypes, ""));
        assert!(!assignment.matches_request(AssignmentType::AvatarMixer, ""));
        assert!(!assignment.matches_request(AssignmentType::AudioMixer, "numerics"));
    }
}
