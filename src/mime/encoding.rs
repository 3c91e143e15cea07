//! Content-transfer and header encodings
//!
//! Base64 and quoted-printable decoders plus the RFC 2047
//! encoded-word machinery. Decoders are liberal in what they accept:
//! base64 tolerates embedded whitespace and missing padding,
//! quoted-printable preserves invalid escapes, and an encoded-word
//! with an unknown charset or encoding is left verbatim.

use crate::error::{Error, Result};
use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

/// Standard alphabet, indifferent to padding. Mail in the wild is
/// sloppy about the trailing `=`.
const FORGIVING_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode base64, ignoring embedded whitespace and line folds.
pub fn decode_base64(input: &[u8]) -> Result<Vec<u8>> {
    let filtered: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .collect();
    FORGIVING_BASE64.decode(&filtered).map_err(|e| {
        Error::parse(
            format!("invalid base64: {e}"),
            String::from_utf8_lossy(input).into_owned(),
        )
    })
}

/// Encode base64 (standard alphabet, padded). Exposed for SASL
/// payloads and tests.
#[must_use]
pub fn encode_base64(input: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(input)
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Decode quoted-printable. Soft line breaks (`=` before EOL)
/// disappear, `=XX` yields the byte, an invalid escape keeps its `=`.
/// With `q_encoding` (RFC 2047 Q), underscores become spaces.
#[must_use]
pub fn decode_quoted_printable(input: &[u8], q_encoding: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'=' => {
                if input.get(i + 1) == Some(&b'\r') && input.get(i + 2) == Some(&b'\n') {
                    i += 3;
                } else if input.get(i + 1) == Some(&b'\n') {
                    i += 2;
                } else if let (Some(hi), Some(lo)) = (
                    input.get(i + 1).copied().and_then(hex_value),
                    input.get(i + 2).copied().and_then(hex_value),
                ) {
                    out.push(hi * 16 + lo);
                    i += 3;
                } else {
                    out.push(b'=');
                    i += 1;
                }
            }
            b'_' if q_encoding => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    out
}

/// Decode a body by its Content-Transfer-Encoding. `7bit`, `8bit`,
/// `binary`, and unknown encodings pass through.
pub fn decode_content(raw: &[u8], encoding: &str) -> Result<Vec<u8>> {
    match encoding.trim().to_lowercase().as_str() {
        "base64" => decode_base64(raw),
        "quoted-printable" => Ok(decode_quoted_printable(raw, false)),
        _ => Ok(raw.to_vec()),
    }
}

/// Decode bytes using a MIME charset label. `encoding_rs` covers the
/// whole WHATWG label set (utf-8, utf-16, ascii, iso-8859-1,
/// windows-1252/cp1252, ...); the one alias it misses in mail headers
/// is the hyphenated `latin-1`.
#[must_use]
pub fn decode_charset(bytes: &[u8], label: &str) -> Option<String> {
    let label = label.trim();
    let label = if label.eq_ignore_ascii_case("latin-1") || label.eq_ignore_ascii_case("latin_1") {
        "latin1"
    } else {
        label
    };
    let encoding = encoding_rs::Encoding::for_label(label.as_bytes())?;
    let (text, _, _) = encoding.decode(bytes);
    Some(text.into_owned())
}

/// Decode every RFC 2047 `=?charset?B|Q?payload?=` run in a header
/// value. Whitespace between two adjacent encoded words is elided per
/// the RFC; anything undecodable stays verbatim.
#[must_use]
pub fn decode_encoded_words(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut previous_was_encoded = false;
    while let Some(start) = rest.find("=?") {
        let prefix = &rest[..start];
        match parse_encoded_word(&rest[start..]) {
            Some((decoded, consumed)) => {
                let elide = previous_was_encoded
                    && !prefix.is_empty()
                    && prefix.chars().all(char::is_whitespace);
                if !elide {
                    out.push_str(prefix);
                }
                out.push_str(&decoded);
                previous_was_encoded = true;
                rest = &rest[start + consumed..];
            }
            None => {
                out.push_str(&rest[..start + 2]);
                previous_was_encoded = false;
                rest = &rest[start + 2..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// One encoded word at the start of `input` (which begins with `=?`).
/// Returns the decoded text and the byte length consumed, or `None`
/// when the syntax, encoding, or charset is unusable.
fn parse_encoded_word(input: &str) -> Option<(String, usize)> {
    let inner = &input[2..];
    let charset_end = inner.find('?')?;
    let charset = &inner[..charset_end];
    let encoding = *inner.as_bytes().get(charset_end + 1)?;
    if inner.as_bytes().get(charset_end + 2) != Some(&b'?') {
        return None;
    }
    let payload_start = charset_end + 3;
    let payload_len = inner.get(payload_start..)?.find("?=")?;
    let payload = &inner[payload_start..payload_start + payload_len];

    let bytes = match encoding.to_ascii_uppercase() {
        b'B' => decode_base64(payload.as_bytes()).ok()?,
        b'Q' => decode_quoted_printable(payload.as_bytes(), true),
        _ => return None,
    };
    let decoded = decode_charset(&bytes, charset)?;
    Some((decoded, 2 + payload_start + payload_len + 2))
}
