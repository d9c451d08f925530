//! Tolerant base64 handling for subscription payloads.
//!
//! Subscription servers ship base64 in several shapes: standard alphabet,
//! URL-safe alphabet, and any of three padding variants (full `==`, single
//! `=`, none). Decoding is strictly opportunistic: content that does not
//! look like base64 is returned untouched.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;

fn shape_full() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:[A-Za-z0-9\-_+/]{4})*[A-Za-z0-9_+/]{4}$").unwrap())
}

fn shape_one_pad() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:[A-Za-z0-9\-_+/]{4})*[A-Za-z0-9_+/]{3}(=)?$").unwrap())
}

fn shape_two_pad() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:[A-Za-z0-9\-_+/]{4})*[A-Za-z0-9_+/]{2}(==)?$").unwrap())
}

/// Rewrite the URL-safe alphabet into the standard one.
fn replace_url_safe(content: &str) -> String {
    content.replace('-', "+").replace('_', "/")
}

fn try_decode(content: &str) -> Option<String> {
    let decoded = STANDARD.decode(replace_url_safe(content)).ok()?;
    String::from_utf8(decoded).ok()
}

/// Decode `content` as base64 if it has a recognizable base64 shape,
/// otherwise return it unchanged. Tries the unpadded, one-pad and two-pad
/// variants in that order, appending missing padding as needed.
pub fn decode_base64_safe(content: &str) -> String {
    if shape_full().is_match(content) {
        if let Some(decoded) = try_decode(content) {
            return decoded;
        }
    }
    if let Some(caps) = shape_one_pad().captures(content) {
        let padded = if caps.get(1).is_none() {
            format!("{}=", content)
        } else {
            content.to_string()
        };
        if let Some(decoded) = try_decode(&padded) {
            return decoded;
        }
    }
    if let Some(caps) = shape_two_pad().captures(content) {
        let padded = if caps.get(1).is_none() {
            format!("{}==", content)
        } else {
            content.to_string()
        };
        if let Some(decoded) = try_decode(&padded) {
            return decoded;
        }
    }
    content.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_standard() {
        assert_eq!(decode_base64_safe("aGVsbG8gd29ybGQ="), "hello world");
    }

    #[test]
    fn test_decode_without_padding() {
        // One missing pad char.
        assert_eq!(decode_base64_safe("aGVsbG8gd29ybGQ"), "hello world");
        // Two missing pad chars.
        assert_eq!(decode_base64_safe("aGVsbG8h"), "hello!");
        assert_eq!(decode_base64_safe("aGVsbG8"), "hello");
    }

    #[test]
    fn test_decode_url_safe_alphabet() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let encoded = URL_SAFE_NO_PAD.encode("ss://a?x=~~subject~~");
        assert_eq!(decode_base64_safe(&encoded), "ss://a?x=~~subject~~");
    }

    #[test]
    fn test_non_base64_returned_unchanged() {
        let plain = "ss://YWVz@example.com:8388#node\ntrojan://pw@host:443";
        assert_eq!(decode_base64_safe(plain), plain);
        assert_eq!(decode_base64_safe(""), "");
        assert_eq!(decode_base64_safe("not base64!!!"), "not base64!!!");
    }

    #[test]
    fn test_binary_payload_rejected() {
        use base64::engine::general_purpose::STANDARD;
        // Valid base64 of invalid UTF-8 stays as the original text.
        let encoded = STANDARD.encode([0xff, 0xfe, 0x00, 0x01]);
        assert_eq!(decode_base64_safe(&encoded), encoded);
    }
}
