//! STUN binding requests and XOR-MAPPED-ADDRESS decoding (RFC 5389 subset).
//!
//! Only what public-address discovery needs: a 20-byte binding request with a
//! random transaction ID, and decoding of the XOR-MAPPED-ADDRESS attribute
//! from a binding success response. Every other attribute is skipped.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Fixed magic cookie.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Binding request message type.
const BINDING_REQUEST: u16 = 0x0001;

/// Binding success response message type.
const BINDING_SUCCESS_RESPONSE: u16 = 0x0101;

/// XOR-MAPPED-ADDRESS attribute type.
const XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Message header size.
pub const STUN_HEADER_SIZE: usize = 20;

/// Transaction ID size.
pub const TRANSACTION_ID_SIZE: usize = 12;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// STUN decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StunError {
    /// Not a binding success response.
    #[error("not a STUN binding response")]
    NotBindingResponse,

    /// Transaction ID differs from the one we sent.
    #[error("transaction ID mismatch")]
    TransactionMismatch,

    /// Message or attribute runs past the datagram.
    #[error("truncated STUN message")]
    Truncated,

    /// No XOR-MAPPED-ADDRESS attribute present.
    #[error("no XOR-MAPPED-ADDRESS attribute")]
    NoMappedAddress,

    /// Unknown address family.
    #[error("unknown address family {0:#04x}")]
    UnknownFamily(u8),
}

/// Build a binding request with the given transaction ID.
pub fn binding_request(transaction_id: &[u8; TRANSACTION_ID_SIZE]) -> [u8; STUN_HEADER_SIZE] {
    let mut request = [0u8; STUN_HEADER_SIZE];
    request[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // length 0: no attributes
    request[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    request[8..20].copy_from_slice(transaction_id);
    request
}

/// Whether a datagram looks like a binding success response.
///
/// Checked on every inbound datagram before envelope parsing.
pub fn is_binding_response(datagram: &[u8]) -> bool {
    datagram.len() >= STUN_HEADER_SIZE
        && datagram[0..2] == BINDING_SUCCESS_RESPONSE.to_be_bytes()
        && datagram[4..8] == MAGIC_COOKIE.to_be_bytes()
}

/// Decode the mapped public socket from a binding success response.
///
/// With `expected_transaction` set, a response to some other request is
/// rejected.
pub fn parse_binding_response(
    datagram: &[u8],
    expected_transaction: Option<&[u8; TRANSACTION_ID_SIZE]>,
) -> Result<SocketAddr, StunError> {
    if !is_binding_response(datagram) {
        return Err(StunError::NotBindingResponse);
    }
    let transaction_id = &datagram[8..20];
    if let Some(expected) = expected_transaction {
        if transaction_id != expected.as_slice() {
            return Err(StunError::TransactionMismatch);
        }
    }

    let message_length = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
    let end = STUN_HEADER_SIZE + message_length;
    if datagram.len() < end {
        return Err(StunError::Truncated);
    }

    let mut offset = STUN_HEADER_SIZE;
    while offset + 4 <= end {
        let attribute_type = u16::from_be_bytes([datagram[offset], datagram[offset + 1]]);
        let attribute_length =
            u16::from_be_bytes([datagram[offset + 2], datagram[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attribute_length;
        if value_end > end {
            return Err(StunError::Truncated);
        }

        if attribute_type == XOR_MAPPED_ADDRESS {
            return decode_xor_mapped_address(&datagram[value_start..value_end], transaction_id);
        }

        // attributes are padded to 4-byte boundaries
        offset = value_start + attribute_length.div_ceil(4) * 4;
    }
    Err(StunError::NoMappedAddress)
}

fn decode_xor_mapped_address(value: &[u8], transaction_id: &[u8]) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::Truncated);
    }
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;

    match value[1] {
        FAMILY_IPV4 => {
            let ip = value.get(4..8).ok_or(StunError::Truncated)?;
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = ip[i] ^ cookie[i];
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        FAMILY_IPV6 => {
            let ip = value.get(4..20).ok_or(StunError::Truncated)?;
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&cookie);
            mask[4..].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = ip[i] ^ mask[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        family => Err(StunError::UnknownFamily(family)),
    }
}
