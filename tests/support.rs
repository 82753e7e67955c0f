//! Shared fixtures for the integration tests: a byte-level frame reader
//! for the plain `tokio::net::TcpStream` sockets the tests use to play the
//! "remote" side of a connection, leaving the library's own connection
//! types exercised exclusively on the side under test.
#![allow(dead_code)]

use bytes::BytesMut;
use soulseek::codec::{try_decode_frame, CodeWidth, MessageFrame};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Reads frames off a raw socket, buffering partial reads across calls so
/// a second `next_frame` can pick up bytes left over from the first.
pub struct FrameReader<'a> {
    stream: &'a mut TcpStream,
    buffer: BytesMut,
    code_width: CodeWidth,
}

impl<'a> FrameReader<'a> {
    pub fn new(stream: &'a mut TcpStream, code_width: CodeWidth) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            code_width,
        }
    }

    pub async fn next_frame(&mut self) -> MessageFrame {
        loop {
            if let Some((frame, consumed)) = try_decode_frame(&self.buffer, self.code_width).unwrap() {
                let _ = self.buffer.split_to(consumed);
                return frame;
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.expect("socket read failed");
            assert!(n > 0, "peer closed before sending a full frame");
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}
