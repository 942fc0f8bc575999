//! WireGuard wire formats
//!
//! Four message types, little-endian fields:
//! type 1 initiation (148 B), type 2 response (92 B), type 3 cookie reply
//! (64 B), type 4 transport (16 B header + AEAD payload).

use crate::error::ProtocolError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

/// First byte of a datagram, if any.
pub fn message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    match data.first() {
        Some(&b) => MessageType::try_from(b),
        None => Err(ProtocolError::InvalidMessageLength {
            expected: 1,
            got: 0,
        }),
    }
}

/// Handshake initiation
///
/// ```text
/// type(1) reserved(3) sender(4) ephemeral(32) enc_static(48) enc_timestamp(28) mac1(16) mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_static: [u8; 48],
    pub encrypted_timestamp: [u8; 28],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    pub const SIZE: usize = 148;
    const MAC1_OFF: usize = 116;
    const MAC2_OFF: usize = 132;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeInitiation as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral_public);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[Self::MAC1_OFF..Self::MAC2_OFF].copy_from_slice(&self.mac1);
        buf[Self::MAC2_OFF..].copy_from_slice(&self.mac2);
        buf
    }

    /// Everything mac1 covers: the message up to the mac1 field.
    pub fn mac1_coverage(buf: &[u8; Self::SIZE]) -> &[u8] {
        &buf[..Self::MAC1_OFF]
    }

    /// Everything mac2 covers: the message up to the mac2 field.
    pub fn mac2_coverage(buf: &[u8; Self::SIZE]) -> &[u8] {
        &buf[..Self::MAC2_OFF]
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        if data[0] != MessageType::HandshakeInitiation as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }
        Ok(Self {
            sender_index: u32::from_le_bytes(data[4..8].try_into().expect("sized")),
            ephemeral_public: data[8..40].try_into().expect("sized"),
            encrypted_static: data[40..88].try_into().expect("sized"),
            encrypted_timestamp: data[88..116].try_into().expect("sized"),
            mac1: data[116..132].try_into().expect("sized"),
            mac2: data[132..148].try_into().expect("sized"),
        })
    }
}

/// Handshake response
///
/// ```text
/// type(1) reserved(3) sender(4) receiver(4) ephemeral(32) enc_empty(16) mac1(16) mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_nothing: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    pub const SIZE: usize = 92;
    const MAC1_OFF: usize = 60;

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        if data[0] != MessageType::HandshakeResponse as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }
        Ok(Self {
            sender_index: u32::from_le_bytes(data[4..8].try_into().expect("sized")),
            receiver_index: u32::from_le_bytes(data[8..12].try_into().expect("sized")),
            ephemeral_public: data[12..44].try_into().expect("sized"),
            encrypted_nothing: data[44..60].try_into().expect("sized"),
            mac1: data[60..76].try_into().expect("sized"),
            mac2: data[76..92].try_into().expect("sized"),
        })
    }

    /// Slice of the raw message that mac1 authenticates.
    pub fn mac1_coverage(data: &[u8]) -> &[u8] {
        &data[..Self::MAC1_OFF]
    }
}

/// Cookie reply
///
/// ```text
/// type(1) reserved(3) receiver(4) nonce(24) enc_cookie(32)
/// ```
#[derive(Debug, Clone)]
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 32],
}

impl CookieReply {
    pub const SIZE: usize = 64;

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        if data[0] != MessageType::CookieReply as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }
        Ok(Self {
            receiver_index: u32::from_le_bytes(data[4..8].try_into().expect("sized")),
            nonce: data[8..32].try_into().expect("sized"),
            encrypted_cookie: data[32..64].try_into().expect("sized"),
        })
    }
}

/// Transport header preceding the AEAD payload
///
/// ```text
/// type(1) reserved(3) receiver(4) counter(8) payload(n+16)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    pub const SIZE: usize = 16;
    /// Header plus at least the authentication tag (a keepalive).
    pub const MIN_MESSAGE: usize = Self::SIZE + 16;

    pub fn build_message(receiver_index: u32, counter: u64, sealed: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + sealed.len());
        buf.push(MessageType::TransportData as u8);
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&receiver_index.to_le_bytes());
        buf.extend_from_slice(&counter.to_le_bytes());
        buf.extend_from_slice(sealed);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::MIN_MESSAGE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::MIN_MESSAGE,
                got: data.len(),
            });
        }
        if data[0] != MessageType::TransportData as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }
        Ok(Self {
            receiver_index: u32::from_le_bytes(data[4..8].try_into().expect("sized")),
            counter: u64::from_le_bytes(data[8..16].try_into().expect("sized")),
        })
    }

    pub fn payload(data: &[u8]) -> &[u8] {
        &data[Self::SIZE..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiation_roundtrip() {
        let msg = HandshakeInitiation {
            sender_index: 0xdead_beef,
            ephemeral_public: [1u8; 32],
            encrypted_static: [2u8; 48],
            encrypted_timestamp: [3u8; 28],
            mac1: [4u8; 16],
            mac2: [5u8; 16],
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 1);
        let back = HandshakeInitiation::from_bytes(&bytes).unwrap();
        assert_eq!(back.sender_index, msg.sender_index);
        assert_eq!(back.encrypted_timestamp, msg.encrypted_timestamp);
        assert_eq!(back.mac2, msg.mac2);
    }

    #[test]
    fn mac_coverage_excludes_the_macs() {
        let msg = HandshakeInitiation {
            sender_index: 1,
            ephemeral_public: [0u8; 32],
            encrypted_static: [0u8; 48],
            encrypted_timestamp: [0u8; 28],
            mac1: [0xffu8; 16],
            mac2: [0xffu8; 16],
        };
        let bytes = msg.to_bytes();
        assert_eq!(HandshakeInitiation::mac1_coverage(&bytes).len(), 116);
        assert_eq!(HandshakeInitiation::mac2_coverage(&bytes).len(), 132);
        assert!(!HandshakeInitiation::mac1_coverage(&bytes).contains(&0xff));
    }

    #[test]
    fn response_parse() {
        let mut data = [0u8; HandshakeResponse::SIZE];
        data[0] = 2;
        data[4..8].copy_from_slice(&77u32.to_le_bytes());
        data[8..12].copy_from_slice(&88u32.to_le_bytes());
        let resp = HandshakeResponse::from_bytes(&data).unwrap();
        assert_eq!(resp.sender_index, 77);
        assert_eq!(resp.receiver_index, 88);
    }

    #[test]
    fn transport_build_and_parse() {
        let msg = TransportHeader::build_message(9, 1000, &[0xaa; 40]);
        let hdr = TransportHeader::from_bytes(&msg).unwrap();
        assert_eq!(hdr.receiver_index, 9);
        assert_eq!(hdr.counter, 1000);
        assert_eq!(TransportHeader::payload(&msg).len(), 40);
    }

    #[test]
    fn wrong_sizes_rejected() {
        assert!(HandshakeInitiation::from_bytes(&[1u8; 147]).is_err());
        assert!(HandshakeResponse::from_bytes(&[2u8; 91]).is_err());
        assert!(CookieReply::from_bytes(&[3u8; 63]).is_err());
        assert!(TransportHeader::from_bytes(&[4u8; 16]).is_err());
        assert!(message_type(&[]).is_err());
        assert!(message_type(&[9]).is_err());
    }
}
