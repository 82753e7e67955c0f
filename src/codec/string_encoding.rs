//! String encoding for the wire format.
//!
//! Writers default to UTF-8; readers attempt strict UTF-8 first and fall
//! back to ISO-8859-1 (Latin-1, a lossless byte-to-codepoint mapping) for
//! legacy peers that emit non-UTF-8 bytes, per the wire format notes.

/// Which encoding to use when writing a string field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    Utf8,
    Latin1,
}

/// Encode a string for the wire, without the length prefix.
pub fn encode_str(value: &str, encoding: StringEncoding) -> Vec<u8> {
    match encoding {
        StringEncoding::Utf8 => value.as_bytes().to_vec(),
        StringEncoding::Latin1 => value.chars().map(|c| c as u32 as u8).collect(),
    }
}

/// Decode a string field's raw bytes: try UTF-8, fall back to Latin-1.
/// Latin-1 decoding never fails since every byte maps to a codepoint.
pub fn decode_str(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ascii() {
        let encoded = encode_str("hello", StringEncoding::Utf8);
        assert_eq!(decode_str(&encoded), "hello");
    }

    #[test]
    fn falls_back_to_latin1_on_invalid_utf8() {
        let bytes = vec![0xE9, 0x20, 0x41]; // 'é' in Latin-1, not valid UTF-8 lead byte alone
        let decoded = decode_str(&bytes);
        assert_eq!(decoded.chars().next(), Some('é'));
    }

    #[test]
    fn latin1_encode_decode_is_lossless_for_byte_values() {
        let original = "café";
        let encoded = encode_str(original, StringEncoding::Latin1);
        let decoded = decode_str(&encoded);
        assert_eq!(decoded, original);
    }
}
