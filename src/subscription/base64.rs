//! Lenient base64 decoding for subscription bodies and share-link payloads.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use tracing::trace;

fn add_padding(value: &str) -> String {
    let remainder = value.len() % 4;
    if remainder == 0 {
        value.to_string()
    } else {
        format!("{value}{}", "=".repeat(4 - remainder))
    }
}

fn is_base64_alphabet(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'-' | b'_' | b'='))
}

/// Decodes standard or URL-safe base64, with or without padding, ignoring
/// embedded whitespace. Returns `None` unless the result is valid UTF-8.
pub fn decode_base64_to_string(input: &str) -> Option<String> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() || !is_base64_alphabet(&cleaned) {
        return None;
    }
    let unpadded = cleaned.trim_end_matches('=');
    let padded = add_padding(unpadded);
    for candidate in [cleaned.as_str(), unpadded, padded.as_str()] {
        for engine in [STANDARD, URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD] {
            if let Ok(bytes) = engine.decode(candidate.as_bytes()) {
                trace!("decoded {} base64 chars", candidate.len());
                return String::from_utf8(bytes).ok();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_padded_and_unpadded() {
        assert_eq!(decode_base64_to_string("aGVsbG8=").as_deref(), Some("hello"));
        assert_eq!(decode_base64_to_string("aGVsbG8").as_deref(), Some("hello"));
    }

    #[test]
    fn decodes_url_safe_alphabet() {
        // "??>" encodes to "Pz8-" in the URL-safe alphabet.
        assert_eq!(decode_base64_to_string("Pz8-").as_deref(), Some("??>"));
    }

    #[test]
    fn ignores_line_breaks() {
        assert_eq!(decode_base64_to_string("aGVs\nbG8=\n").as_deref(), Some("hello"));
    }

    #[test]
    fn rejects_non_alphabet_and_empty() {
        assert!(decode_base64_to_string("ss://abc").is_none());
        assert!(decode_base64_to_string("").is_none());
        assert!(decode_base64_to_string("  \n").is_none());
    }

    #[test]
    fn rejects_invalid_utf8() {
        // 0xff 0xfe
        assert!(decode_base64_to_string("//4=").is_none());
    }
}
