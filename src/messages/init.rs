//! Initialization-channel message catalog (narrow, 1-byte codes).
//!
//! These are the only two messages a freshly accepted inbound socket can
//! open with, per the listener's classification step.

use bytes::Bytes;

use crate::codec::{CodeWidth, MessageBuilder, MessageFrame, MessageReader};
use crate::error::{SlskError, SlskResult};
use crate::messages::common::PeerConnectionType;

pub const PIERCE_FIREWALL: u8 = 0x00;
pub const PEER_INIT: u8 = 0x01;

#[derive(Debug, Clone, Copy)]
pub struct PierceFirewall {
    pub token: u32,
}

impl PierceFirewall {
    pub fn to_bytes(&self) -> Bytes {
        let mut builder = MessageBuilder::new();
        builder.write_u32(self.token);
        builder.finish(CodeWidth::Narrow, PIERCE_FIREWALL as u32)
    }

    pub fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            token: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PeerInit {
    pub username: String,
    pub connection_type: PeerConnectionType,
    pub token: u32,
}

impl PeerInit {
    pub fn to_bytes(&self) -> Bytes {
        let mut builder = MessageBuilder::new();
        builder
            .write_string(&self.username)
            .write_string(self.connection_type.as_str())
            .write_u32(self.token);
        builder.finish(CodeWidth::Narrow, PEER_INIT as u32)
    }

    pub fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        let username = reader.read_string()?;
        let type_str = reader.read_string()?;
        let connection_type = PeerConnectionType::parse(&type_str)
            .ok_or_else(|| SlskError::Protocol(format!("unknown connection type {type_str}")))?;
        Ok(Self {
            username,
            connection_type,
            token: reader.read_u32()?,
        })
    }
}

/// Classification of an inbound socket's first frame, per the listener's
/// demultiplexing rule: anything other than the two known codes closes the
/// socket with a protocol error rather than being silently dropped, since
/// (unlike the distributed channel) no further bytes can safely be read
/// from a misclassified handshake.
#[derive(Debug, Clone)]
pub enum InitMessage {
    PierceFirewall(PierceFirewall),
    PeerInit(PeerInit),
}

impl InitMessage {
    pub fn decode(frame: &MessageFrame) -> SlskResult<Self> {
        let mut reader = MessageReader::new(frame.payload.clone());
        match frame.code as u8 {
            PIERCE_FIREWALL => Ok(InitMessage::PierceFirewall(PierceFirewall::decode_payload(&mut reader)?)),
            PEER_INIT => Ok(InitMessage::PeerInit(PeerInit::decode_payload(&mut reader)?)),
            other => Err(SlskError::Protocol(format!("unknown handshake code {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pierce_firewall_round_trips() {
        let message = PierceFirewall { token: 42 };
        let bytes = message.to_bytes();
        let (frame, _) = crate::codec::try_decode_frame(&bytes, CodeWidth::Narrow)
            .unwrap()
            .unwrap();
        match InitMessage::decode(&frame).unwrap() {
            InitMessage::PierceFirewall(p) => assert_eq!(p.token, 42),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn peer_init_round_trips() {
        let message = PeerInit {
            username: "bob".into(),
            connection_type: PeerConnectionType::Message,
            token: 7,
        };
        let bytes = message.to_bytes();
        let (frame, _) = crate::codec::try_decode_frame(&bytes, CodeWidth::Narrow)
            .unwrap()
            .unwrap();
        match InitMessage::decode(&frame).unwrap() {
            InitMessage::PeerInit(p) => {
                assert_eq!(p.username, "bob");
                assert!(matches!(p.connection_type, PeerConnectionType::Message));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_handshake_code_errors() {
        let bytes = crate::codec::encode_frame(CodeWidth::Narrow, 0x02, b"");
        let (frame, _) = crate::codec::try_decode_frame(&bytes, CodeWidth::Narrow)
            .unwrap()
            .unwrap();
        assert!(InitMessage::decode(&frame).is_err());
    }
}
