//! Relay control messages
//!
//! Relay tunnels are negotiated over the established tunnel to the relay
//! peer with length-delimited control messages. Requests are idempotent, so
//! retransmitting one while the relay is still `Requested` is safe.

use prost::Message as _;

use crate::error::WireError;

/// Control message kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ControlMessageType {
    None = 0,
    CreateRelayRequest = 1,
    CreateRelayResponse = 2,
}

/// Relay coordination message
#[derive(Clone, PartialEq, prost::Message)]
pub struct ControlMessage {
    #[prost(enumeration = "ControlMessageType", tag = "1")]
    pub message_type: i32,

    /// Relay index chosen by the peer initiating the relay
    #[prost(uint32, tag = "2")]
    pub initiator_relay_index: u32,

    /// Relay index chosen by the responder, set on responses
    #[prost(uint32, tag = "3")]
    pub responder_relay_index: u32,

    /// Overlay address of the peer requesting the relay
    #[prost(uint32, tag = "4")]
    pub relay_from_ip: u32,

    /// Overlay address of the peer the relay should forward to
    #[prost(uint32, tag = "5")]
    pub relay_to_ip: u32,
}

impl ControlMessage {
    pub fn create_relay_request(initiator_relay_index: u32, from: u32, to: u32) -> Self {
        Self {
            message_type: ControlMessageType::CreateRelayRequest as i32,
            initiator_relay_index,
            responder_relay_index: 0,
            relay_from_ip: from,
            relay_to_ip: to,
        }
    }

    pub fn create_relay_response(
        initiator_relay_index: u32,
        responder_relay_index: u32,
        from: u32,
        to: u32,
    ) -> Self {
        Self {
            message_type: ControlMessageType::CreateRelayResponse as i32,
            initiator_relay_index,
            responder_relay_index,
            relay_from_ip: from,
            relay_to_ip: to,
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        prost::Message::encode_to_vec(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        Ok(<Self as prost::Message>::decode(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_roundtrip() {
        let msg = ControlMessage::create_relay_request(42, 0x0a000001, 0x0a000002);
        let bytes = msg.encode_to_vec();
        let back = ControlMessage::decode(&bytes).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.message_type(), ControlMessageType::CreateRelayRequest);
    }

    #[test]
    fn test_response_carries_both_indexes() {
        let msg = ControlMessage::create_relay_response(42, 99, 1, 2);
        let back = ControlMessage::decode(&msg.encode_to_vec()).unwrap();
        assert_eq!(back.initiator_relay_index, 42);
        assert_eq!(back.responder_relay_index, 99);
        assert_eq!(back.message_type(), ControlMessageType::CreateRelayResponse);
    }

    #[test]
    fn test_unknown_type_maps_to_none() {
        let msg = ControlMessage {
            message_type: 77,
            ..Default::default()
        };
        let back = ControlMessage::decode(&msg.encode_to_vec()).unwrap();
        assert_eq!(back.message_type(), ControlMessageType::None);
    }
}
