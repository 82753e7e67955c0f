//! Length-prefixed framing, builders, and readers.
//!
//! A serialize/deserialize pair built around the bit-exact binary layout
//! the wire protocol requires: `[u32 length LE][code][payload]`, with the
//! code width depending on the channel.

use std::io::Read;

use bytes::{Bytes, BytesMut};
use flate2::read::ZlibDecoder;

use crate::codec::string_encoding::{decode_str, encode_str, StringEncoding};
use crate::error::{SlskError, SlskResult};

/// Code width varies by channel: narrow (1 byte) on the initialization and
/// distributed channels, wide (4 bytes) on the server and peer channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeWidth {
    Narrow,
    Wide,
}

impl CodeWidth {
    fn size(self) -> usize {
        match self {
            CodeWidth::Narrow => 1,
            CodeWidth::Wide => 4,
        }
    }
}

/// A decoded frame: the channel-specific code (widened to `u32` regardless
/// of wire width) and its payload, with the frame's length prefix already
/// consumed.
#[derive(Debug, Clone)]
pub struct MessageFrame {
    pub code: u32,
    pub payload: Bytes,
}

/// Attempt to decode one frame from the front of `buf`. Returns `Ok(None)`
/// when `buf` doesn't yet contain a complete frame (the caller should read
/// more bytes and retry); returns `Ok(Some((frame, consumed)))` on success.
pub fn try_decode_frame(buf: &[u8], code_width: CodeWidth) -> SlskResult<Option<(MessageFrame, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = 4 + length;
    if buf.len() < total {
        return Ok(None);
    }
    let code_size = code_width.size();
    if length < code_size {
        return Err(SlskError::Protocol(format!(
            "frame length {length} shorter than code width {code_size}"
        )));
    }
    let code_bytes = &buf[4..4 + code_size];
    let code = match code_width {
        CodeWidth::Narrow => code_bytes[0] as u32,
        CodeWidth::Wide => u32::from_le_bytes([code_bytes[0], code_bytes[1], code_bytes[2], code_bytes[3]]),
    };
    let payload = Bytes::copy_from_slice(&buf[4 + code_size..total]);
    Ok(Some((MessageFrame { code, payload }, total)))
}

/// Encode a complete frame: `[u32 length][code][payload]`.
pub fn encode_frame(code_width: CodeWidth, code: u32, payload: &[u8]) -> Bytes {
    let code_size = code_width.size();
    let length = (code_size + payload.len()) as u32;
    let mut buf = BytesMut::with_capacity(4 + code_size + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    match code_width {
        CodeWidth::Narrow => buf.extend_from_slice(&[code as u8]),
        CodeWidth::Wide => buf.extend_from_slice(&code.to_le_bytes()),
    }
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Accumulates a message payload with primitive writers, then produces a
/// complete wire frame via [`finish`](MessageBuilder::finish).
#[derive(Debug, Default)]
pub struct MessageBuilder {
    payload: Vec<u8>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self { payload: Vec::new() }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.payload.push(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(value as u8)
    }

    /// Write a 4-byte IPv4 address, stored little-endian (octets reversed
    /// relative to normal big-endian network order).
    pub fn write_ipv4(&mut self, addr: std::net::Ipv4Addr) -> &mut Self {
        let mut octets = addr.octets();
        octets.reverse();
        self.payload.extend_from_slice(&octets);
        self
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_string_as(value, StringEncoding::Utf8)
    }

    pub fn write_string_as(&mut self, value: &str, encoding: StringEncoding) -> &mut Self {
        let bytes = encode_str(value, encoding);
        self.write_u32(bytes.len() as u32);
        self.payload.extend_from_slice(&bytes);
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.payload.extend_from_slice(bytes);
        self
    }

    pub fn finish(self, code_width: CodeWidth, code: u32) -> Bytes {
        encode_frame(code_width, code, &self.payload)
    }

    /// The raw accumulated payload, without length prefix or code. Used by
    /// transfer-connection handshakes that are not framed messages (the
    /// 8-byte start-offset exchange).
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Reads primitives out of a decoded frame's payload with a position
/// cursor, supporting `seek`, `remaining`, and in-place zlib `decompress`.
#[derive(Debug, Clone)]
pub struct MessageReader {
    buf: Bytes,
    pos: usize,
}

impl MessageReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> SlskResult<&[u8]> {
        if self.remaining() < n {
            return Err(SlskError::Protocol(format!(
                "expected {n} more bytes, only {} remain",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> SlskResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> SlskResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> SlskResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> SlskResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a 4-byte IPv4 address stored little-endian (octets reversed
    /// relative to normal big-endian network order).
    pub fn read_ipv4(&mut self) -> SlskResult<std::net::Ipv4Addr> {
        let b = self.take(4)?;
        Ok(std::net::Ipv4Addr::new(b[3], b[2], b[1], b[0]))
    }

    pub fn read_string(&mut self) -> SlskResult<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        Ok(decode_str(bytes))
    }

    pub fn read_bytes(&mut self, n: usize) -> SlskResult<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Remainder of the payload, for callers that want raw trailing bytes
    /// without failing (tolerating unknown trailing server-message groups).
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let rest = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        rest
    }

    /// Inflate the remainder of the payload in place, replacing it with the
    /// decompressed bytes and resetting the cursor to 0. Used for
    /// zlib-compressed browse/search response payloads.
    pub fn decompress(&mut self) -> SlskResult<()> {
        let compressed = &self.buf[self.pos..];
        let mut decoder = ZlibDecoder::new(compressed);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| SlskError::MessageCompression(e.to_string()))?;
        self.buf = Bytes::from(out);
        self.pos = 0;
        Ok(())
    }
}

/// Compress payload bytes with zlib, for outgoing browse/search responses.
pub fn compress(payload: &[u8]) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing to an in-memory buffer cannot fail.
    encoder.write_all(payload).expect("in-memory zlib write");
    encoder.finish().expect("in-memory zlib finish")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let mut builder = MessageBuilder::new();
        builder.write_u32(7).write_string("hello");
        let frame_bytes = builder.finish(CodeWidth::Wide, 42);

        let (frame, consumed) = try_decode_frame(&frame_bytes, CodeWidth::Wide)
            .unwrap()
            .unwrap();
        assert_eq!(consumed, frame_bytes.len());
        assert_eq!(frame.code, 42);

        let mut reader = MessageReader::new(frame.payload);
        assert_eq!(reader.read_u32().unwrap(), 7);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn framing_length_prefix_matches_payload_plus_code() {
        let payload = vec![0u8; 100];
        let frame_bytes = encode_frame(CodeWidth::Wide, 1, &payload);
        let declared_len = u32::from_le_bytes([
            frame_bytes[0],
            frame_bytes[1],
            frame_bytes[2],
            frame_bytes[3],
        ]);
        assert_eq!(declared_len as usize, payload.len() + 4);
        assert_eq!(frame_bytes.len(), payload.len() + 4 + 4);
    }

    #[test]
    fn narrow_code_width_uses_one_byte() {
        let frame_bytes = encode_frame(CodeWidth::Narrow, 0x01, &[9, 9]);
        let (frame, _) = try_decode_frame(&frame_bytes, CodeWidth::Narrow)
            .unwrap()
            .unwrap();
        assert_eq!(frame.code, 1);
        assert_eq!(&frame.payload[..], &[9, 9]);
    }

    #[test]
    fn incomplete_buffer_yields_none() {
        let frame_bytes = encode_frame(CodeWidth::Wide, 1, b"hello world");
        assert!(try_decode_frame(&frame_bytes[..5], CodeWidth::Wide)
            .unwrap()
            .is_none());
    }

    #[test]
    fn decompress_round_trips() {
        let original = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let compressed = compress(&original);
        let mut reader = MessageReader::new(Bytes::from(compressed));
        reader.decompress().unwrap();
        assert_eq!(reader.read_remaining(), original);
    }

    #[test]
    fn tolerates_trailing_bytes_after_required_fields() {
        let mut builder = MessageBuilder::new();
        builder.write_u32(1).write_bytes(&[0xFF, 0xFF, 0xFF]);
        let frame_bytes = builder.finish(CodeWidth::Wide, 1);
        let (frame, _) = try_decode_frame(&frame_bytes, CodeWidth::Wide)
            .unwrap()
            .unwrap();
        let mut reader = MessageReader::new(frame.payload);
        assert_eq!(reader.read_u32().unwrap(), 1);
        // Caller ignores the rest; no error on having unread trailing bytes.
        assert_eq!(reader.remaining(), 3);
    }
}
