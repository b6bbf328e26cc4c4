//! Label-safe payload encoding
//!
//! Payload bytes travel as standard-alphabet base64 with the trailing `=`
//! padding stripped, so every character is legal inside a DNS label.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::{Result, TunnelError};

/// Encode bytes as unpadded standard base64
pub fn encode(data: &[u8]) -> String {
    let mut encoded = BASE64.encode(data);
    let trimmed = encoded.trim_end_matches('=').len();
    encoded.truncate(trimmed);
    encoded
}

/// Decode unpadded base64 back to bytes
///
/// The input is right-padded with `=` to a multiple of 4 before decoding.
/// A final quantum of a single character can never be produced by
/// [`encode`] and is rejected.
pub fn decode(encoded: &str) -> Result<Vec<u8>> {
    let mut padded = String::with_capacity(padded_len(encoded.len()));
    padded.push_str(encoded);
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    BASE64
        .decode(padded.as_bytes())
        .map_err(|e| TunnelError::Decode(format!("base64 decode failed: {}", e)))
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(4) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_strips_padding() {
        assert_eq!(encode(b"hello"), "aGVsbG8");
        assert_eq!(encode(b"he"), "aGU");
        assert_eq!(encode(b"hel"), "aGVs");
        assert_eq!(encode(b""), "");
    }

    #[test]
    fn test_round_trip_odd_lengths() {
        for len in 0..16 {
            let data: Vec<u8> = (0..len as u8).map(|b| b.wrapping_mul(37)).collect();
            assert_eq!(decode(&encode(&data)).unwrap(), data, "length {}", len);
        }
    }

    #[test]
    fn test_round_trip_every_byte_value() {
        let data: Vec<u8> = (0..=255u8).collect();
        let encoded = encode(&data);

        assert!(encoded
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/'));
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_zero_bytes_survive() {
        let data = b"\0a\0\0b\0";
        assert_eq!(decode(&encode(data)).unwrap(), data.to_vec());
    }

    #[test]
    fn test_decode_rejects_foreign_characters() {
        assert!(matches!(decode("aGV-bG8"), Err(TunnelError::Decode(_))));
        assert!(matches!(decode("aG.sbG8"), Err(TunnelError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_dangling_character() {
        // 5 characters pad to 8, but a lone sextet cannot encode a byte
        assert!(decode("aGVsb").is_err());
    }

    #[test]
    fn test_concatenated_slices_decode_as_whole() {
        let data = vec![0xA5u8; 300];
        let encoded = encode(&data);
        let (left, right) = encoded.split_at(126);

        let mut joined = String::from(left);
        joined.push_str(right);
        assert_eq!(decode(&joined).unwrap(), data);
    }
}
