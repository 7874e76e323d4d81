//! Packet header
//!
//! Wire format, 17 bytes:
//! [Version: 1][Type: 1][Subtype: 1][Reserved: 2][RemoteIndex: 4][MessageCounter: 8]
//! Multi-byte fields are big-endian. The Noise payload follows the header.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::WireError;

/// Header length in bytes
pub const HEADER_LEN: usize = 17;

/// Current wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Offset of the subtype byte, read by transmit metrics
pub const SUBTYPE_OFFSET: usize = 2;

/// Packet type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Tunnel establishment
    Handshake = 0,

    /// Encrypted application datagram
    Message = 1,

    /// Relay coordination and other control traffic
    Control = 2,

    /// Orderly tunnel teardown
    CloseTunnel = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(Self::Handshake),
            1 => Ok(Self::Message),
            2 => Ok(Self::Control),
            3 => Ok(Self::CloseTunnel),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// Handshake subtype: Noise IX with pre-shared key, stage numbering in the
/// message counter
pub const SUBTYPE_IX_PSK0: u8 = 0;

/// Subtype for packet types that carry none
pub const SUBTYPE_NONE: u8 = 0;

/// A parsed packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub message_type: MessageType,
    pub subtype: u8,
    pub reserved: u16,
    pub remote_index: u32,
    pub message_counter: u64,
}

impl Header {
    pub fn new(message_type: MessageType, subtype: u8, remote_index: u32, counter: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            subtype,
            reserved: 0,
            remote_index,
            message_counter: counter,
        }
    }

    /// A stage-1 handshake header.
    pub fn handshake(remote_index: u32, stage: u64) -> Self {
        Self::new(MessageType::Handshake, SUBTYPE_IX_PSK0, remote_index, stage)
    }

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Append the wire form to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(self.subtype);
        buf.put_u16(self.reserved);
        buf.put_u32(self.remote_index);
        buf.put_u64(self.message_counter);
    }

    /// Parse a header from the front of `packet`.
    pub fn parse(packet: &[u8]) -> Result<Self, WireError> {
        if packet.len() < HEADER_LEN {
            return Err(WireError::TooShort(packet.len()));
        }

        let mut buf = packet;
        let version = buf.get_u8();
        let message_type = MessageType::try_from(buf.get_u8())?;
        let subtype = buf.get_u8();
        let reserved = buf.get_u16();
        let remote_index = buf.get_u32();
        let message_counter = buf.get_u64();

        Ok(Self {
            version,
            message_type,
            subtype,
            reserved,
            remote_index,
            message_counter,
        })
    }
}

/// Read the subtype byte of an encoded packet without a full parse.
pub fn subtype_of(packet: &[u8]) -> u8 {
    packet.get(SUBTYPE_OFFSET).copied().unwrap_or(SUBTYPE_NONE)
}
