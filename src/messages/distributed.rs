//! Distributed-channel message catalog (narrow, 1-byte codes).

use std::collections::HashMap;

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::codec::{CodeWidth, MessageBuilder, MessageFrame, MessageReader};
use crate::error::{SlskError, SlskResult};

pub trait DistributedPayload: Sized {
    const CODE: u8;

    fn encode_payload(&self, builder: &mut MessageBuilder);
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self>;

    fn to_bytes(&self) -> Bytes {
        let mut builder = MessageBuilder::new();
        self.encode_payload(&mut builder);
        builder.finish(CodeWidth::Narrow, Self::CODE as u32)
    }

    fn from_frame(frame: &MessageFrame) -> SlskResult<Self> {
        if frame.code != Self::CODE as u32 {
            return Err(SlskError::UnexpectedMessageCode {
                expected: Self::CODE as u32,
                found: frame.code,
            });
        }
        let mut reader = MessageReader::new(frame.payload.clone());
        Self::decode_payload(&mut reader)
    }
}

/// The codes named as confirmed in normal operation; any other code
/// encountered on this channel is logged and dropped, not rejected.
pub const PING: u8 = 0;
pub const SEARCH_REQUEST: u8 = 3;
pub const BRANCH_LEVEL: u8 = 4;
pub const BRANCH_ROOT: u8 = 5;
pub const CHILD_DEPTH: u8 = 7;

#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

impl DistributedPayload for Ping {
    const CODE: u8 = PING;
    fn encode_payload(&self, _builder: &mut MessageBuilder) {}
    fn decode_payload(_reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Ping)
    }
}

/// A distributed search request: forwarded verbatim from parent to every
/// child, and answered locally if our search resolver matches.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub username: String,
    pub token: u32,
    pub query: String,
}

impl DistributedPayload for SearchRequest {
    const CODE: u8 = SEARCH_REQUEST;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_string(&self.username)
            .write_u32(self.token)
            .write_string(&self.query);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
            token: reader.read_u32()?,
            query: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BranchLevel {
    pub level: u32,
}

impl DistributedPayload for BranchLevel {
    const CODE: u8 = BRANCH_LEVEL;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.level);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            level: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BranchRoot {
    pub username: String,
}

impl DistributedPayload for BranchRoot {
    const CODE: u8 = BRANCH_ROOT;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.username);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChildDepth {
    pub depth: u32,
}

impl DistributedPayload for ChildDepth {
    const CODE: u8 = CHILD_DEPTH;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.depth);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            depth: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone)]
pub enum DistributedMessage {
    Ping(Ping),
    SearchRequest(SearchRequest),
    BranchLevel(BranchLevel),
    BranchRoot(BranchRoot),
    ChildDepth(ChildDepth),
}

type DistributedDecoder = fn(&MessageFrame) -> SlskResult<DistributedMessage>;

static DISTRIBUTED_DISPATCH: Lazy<HashMap<u8, DistributedDecoder>> = Lazy::new(|| {
    let mut table: HashMap<u8, DistributedDecoder> = HashMap::new();
    table.insert(PING, |f| Ping::from_frame(f).map(DistributedMessage::Ping));
    table.insert(SEARCH_REQUEST, |f| {
        SearchRequest::from_frame(f).map(DistributedMessage::SearchRequest)
    });
    table.insert(BRANCH_LEVEL, |f| BranchLevel::from_frame(f).map(DistributedMessage::BranchLevel));
    table.insert(BRANCH_ROOT, |f| BranchRoot::from_frame(f).map(DistributedMessage::BranchRoot));
    table.insert(CHILD_DEPTH, |f| ChildDepth::from_frame(f).map(DistributedMessage::ChildDepth));
    table
});

impl DistributedMessage {
    /// Decode via the dispatch table. A code outside the confirmed set
    /// (`Ping`, `SearchRequest`, `BranchLevel`, `BranchRoot`, `ChildDepth`)
    /// yields `Ok(None)`; callers log and drop rather than reject.
    pub fn decode(frame: &MessageFrame) -> SlskResult<Option<Self>> {
        if frame.code > u8::MAX as u32 {
            return Ok(None);
        }
        match DISTRIBUTED_DISPATCH.get(&(frame.code as u8)) {
            Some(decoder) => decoder(frame).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_request_round_trips_verbatim() {
        let request = SearchRequest {
            username: "carol".into(),
            token: 7,
            query: "foo".into(),
        };
        let bytes = request.to_bytes();
        let (frame, _) = crate::codec::try_decode_frame(&bytes, CodeWidth::Narrow)
            .unwrap()
            .unwrap();
        let decoded = SearchRequest::from_frame(&frame).unwrap();
        assert_eq!(decoded.username, "carol");
        assert_eq!(decoded.token, 7);
        assert_eq!(decoded.query, "foo");
        // Forwarding to children re-encodes to byte-identical output.
        assert_eq!(decoded.to_bytes(), bytes);
    }

    #[test]
    fn unknown_code_is_dropped_not_rejected() {
        let bytes = crate::codec::encode_frame(CodeWidth::Narrow, 250, b"");
        let (frame, _) = crate::codec::try_decode_frame(&bytes, CodeWidth::Narrow)
            .unwrap()
            .unwrap();
        assert!(DistributedMessage::decode(&frame).unwrap().is_none());
    }
}
