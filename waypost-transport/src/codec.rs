//! Payload codec.
//!
//! Integers are big-endian. Strings carry a `u16` length prefix, byte blobs a
//! `u32` one. Socket addresses are `[family:u8][ip][port:u16]` with family
//! `0` meaning "unset", `4` and `6` the IP versions. Optional UUIDs are a
//! presence flag followed by 16 bytes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;
use waypost_core::{AssignmentType, NodeType, TypeTagError};

/// Payload decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Payload ended before a field was complete.
    #[error("truncated payload: need {needed} more bytes, have {have}")]
    Truncated {
        /// Bytes the field needs.
        needed: usize,
        /// Bytes left in the payload.
        have: usize,
    },

    /// A string field is not UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// Unknown socket address family byte.
    #[error("invalid socket family {0}")]
    InvalidSocketFamily(u8),

    /// Unknown node or assignment type byte.
    #[error(transparent)]
    TypeTag(#[from] TypeTagError),

    /// Field value out of range.
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}

/// Sequential payload writer.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and return the payload.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    /// Write a byte.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Write a big-endian `u16`.
    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    /// Write a big-endian `u64`.
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    /// Write a boolean as one byte.
    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    /// Write raw bytes with no prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Write a UUID.
    pub fn put_uuid(&mut self, uuid: &Uuid) -> &mut Self {
        self.buf.put_slice(uuid.as_bytes());
        self
    }

    /// Write an optional UUID.
    pub fn put_optional_uuid(&mut self, uuid: Option<&Uuid>) -> &mut Self {
        match uuid {
            Some(uuid) => self.put_u8(1).put_uuid(uuid),
            None => self.put_u8(0),
        }
    }

    /// Write a `u16`-prefixed string, truncating at `u16::MAX` bytes.
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        let mut end = value.len().min(u16::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.put_u16(end as u16);
        self.buf.put_slice(&value.as_bytes()[..end]);
        self
    }

    /// Write a `u32`-prefixed byte blob.
    pub fn put_blob(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    /// Write a socket address, `None` encoding as family 0.
    pub fn put_socket(&mut self, addr: Option<SocketAddr>) -> &mut Self {
        match addr {
            None => {
                self.buf.put_u8(0);
            }
            Some(SocketAddr::V4(v4)) => {
                self.buf.put_u8(4);
                self.buf.put_slice(&v4.ip().octets());
                self.buf.put_u16(v4.port());
            }
            Some(SocketAddr::V6(v6)) => {
                self.buf.put_u8(6);
                self.buf.put_slice(&v6.ip().octets());
                self.buf.put_u16(v6.port());
            }
        }
        self
    }

    /// Write a node type byte.
    pub fn put_node_type(&mut self, node_type: NodeType) -> &mut Self {
        self.put_u8(node_type.as_u8())
    }

    /// Write a `u8`-counted list of node types.
    pub fn put_node_types(&mut self, types: &[NodeType]) -> &mut Self {
        self.put_u8(types.len().min(u8::MAX as usize) as u8);
        for node_type in types.iter().take(u8::MAX as usize) {
            self.put_node_type(*node_type);
        }
        self
    }

    /// Write an assignment type byte.
    pub fn put_assignment_type(&mut self, assignment_type: AssignmentType) -> &mut Self {
        self.put_u8(assignment_type.as_u8())
    }
}

/// Sequential payload reader over a borrowed slice.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    /// Start reading `payload`.
    pub fn new(payload: &'a [u8]) -> Self {
        Self { buf: payload }
    }

    /// Bytes not read yet.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::Truncated {
                needed,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Read a byte.
    pub fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read a big-endian `u16`.
    pub fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    /// Read a big-endian `u32`.
    pub fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    /// Read a big-endian `u64`.
    pub fn u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    /// Read a one-byte boolean.
    pub fn bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.u8()? != 0)
    }

    /// Read `len` raw bytes.
    pub fn raw(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Everything not read yet.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    /// Read a UUID.
    pub fn uuid(&mut self) -> Result<Uuid, CodecError> {
        let bytes = self.raw(16)?;
        Uuid::from_slice(bytes).map_err(|_| CodecError::InvalidValue("uuid"))
    }

    /// Read an optional UUID.
    pub fn optional_uuid(&mut self) -> Result<Option<Uuid>, CodecError> {
        match self.u8()? {
            0 => Ok(None),
            _ => self.uuid().map(Some),
        }
    }

    /// Read a `u16`-prefixed string.
    pub fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let bytes = self.raw(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a `u32`-prefixed byte blob.
    pub fn blob(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()? as usize;
        Ok(self.raw(len)?.to_vec())
    }

    /// Read a socket address; family 0 is `None`.
    pub fn socket(&mut self) -> Result<Option<SocketAddr>, CodecError> {
        match self.u8()? {
            0 => Ok(None),
            4 => {
                let octets: [u8; 4] = self
                    .raw(4)?
                    .try_into()
                    .map_err(|_| CodecError::InvalidValue("ipv4"))?;
                let port = self.u16()?;
                Ok(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)))
            }
            6 => {
                let octets: [u8; 16] = self
                    .raw(16)?
                    .try_into()
                    .map_err(|_| CodecError::InvalidValue("ipv6"))?;
                let port = self.u16()?;
                Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
            }
            family => Err(CodecError::InvalidSocketFamily(family)),
        }
    }

    /// Read a node type byte.
    pub fn node_type(&mut self) -> Result<NodeType, CodecError> {
        Ok(NodeType::try_from(self.u8()?)?)
    }

    /// Read a `u8`-counted list of node types.
    pub fn node_types(&mut self) -> Result<Vec<NodeType>, CodecError> {
        let count = self.u8()?;
        (0..count).map(|_| self.node_type()).collect()
    }

    /// Read an assignment type byte.
    pub fn assignment_type(&mut self) -> Result<AssignmentType, CodecError> {
        Ok(AssignmentType::try_from(self.u8()?)?)
    }
}
