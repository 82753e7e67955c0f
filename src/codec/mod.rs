//! Wire codec: length-prefixed framing, primitive readers/writers, and
//! string encoding fallback.

pub mod frame;
pub mod string_encoding;

pub use frame::{compress, encode_frame, try_decode_frame, CodeWidth, MessageBuilder, MessageFrame, MessageReader};
pub use string_encoding::{decode_str, encode_str, StringEncoding};
