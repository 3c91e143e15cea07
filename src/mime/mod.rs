//! MIME decoding (RFC 2045/2046/2047/2822)
//!
//! Consumed on demand from FETCH results: header unfolding and
//! parsing, encoded-word decoding, content-transfer decoding,
//! multipart splitting, and flattening a part tree into IMAP-numbered
//! leaf parts. Parsing follows the robustness principle: malformed
//! input degrades to a best-effort value, never a panic.

mod encoding;
mod multipart;

pub use encoding::{
    decode_base64, decode_charset, decode_content, decode_encoded_words, decode_quoted_printable,
    encode_base64,
};
pub use multipart::split_multipart_body;

use crate::types::MessagePart;

/// Parsed message headers: lower-cased names, decoded values, in
/// arrival order. Duplicate names accumulate; `get` returns the first
/// occurrence and `get_all` every one.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    fn push(&mut self, name: String, value: String) {
        self.entries.push((name, value));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Replace every CRLF-or-LF followed by whitespace with a single
/// space (RFC 2822 unfolding).
#[must_use]
pub fn unfold_headers(block: &str) -> String {
    let bytes = block.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let fold_len = if bytes[i] == b'\r'
            && bytes.get(i + 1) == Some(&b'\n')
            && matches!(bytes.get(i + 2), Some(b' ' | b'\t'))
        {
            Some(2)
        } else if bytes[i] == b'\n' && matches!(bytes.get(i + 1), Some(b' ' | b'\t')) {
            Some(1)
        } else {
            None
        };
        match fold_len {
            Some(eol) => {
                out.push(b' ');
                i += eol;
                while matches!(bytes.get(i), Some(b' ' | b'\t')) {
                    i += 1;
                }
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    // Only ASCII sequences were touched, so this cannot fail on
    // originally valid UTF-8.
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a header block: unfold, split each line at the first `:`,
/// lower-case the name, decode encoded-words in the value.
#[must_use]
pub fn parse_headers(block: &str) -> HeaderMap {
    let unfolded = unfold_headers(block);
    let mut map = HeaderMap::default();
    for line in unfolded.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            map.push(
                name.trim().to_lowercase(),
                decode_encoded_words(value.trim()),
            );
        }
    }
    map
}

/// A parsed Content-Type value.
#[derive(Debug, Clone)]
pub struct ContentType {
    pub primary: String,
    pub subtype: String,
    /// Parameters in order, names lower-cased, values unquoted.
    pub params: Vec<(String, String)>,
}

impl Default for ContentType {
    fn default() -> Self {
        Self {
            primary: "text".to_string(),
            subtype: "plain".to_string(),
            params: Vec::new(),
        }
    }
}

impl ContentType {
    #[must_use]
    pub fn is_multipart(&self) -> bool {
        self.primary == "multipart"
    }

    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `type/subtype`.
    #[must_use]
    pub fn essence(&self) -> String {
        format!("{}/{}", self.primary, self.subtype)
    }
}

fn strip_quotes(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Parse a Content-Type header value into type, subtype, and
/// parameters.
#[must_use]
pub fn parse_content_type(value: &str) -> ContentType {
    let mut segments = value.split(';');
    let essence = segments.next().unwrap_or("").trim().to_lowercase();
    let (primary, subtype) = match essence.find('/') {
        Some(slash) => (
            essence[..slash].to_string(),
            essence[slash + 1..].to_string(),
        ),
        None => (essence, String::new()),
    };
    let params = segments
        .filter_map(|segment| {
            let (name, value) = segment.split_once('=')?;
            Some((
                name.trim().to_lowercase(),
                strip_quotes(value).to_string(),
            ))
        })
        .collect();
    ContentType {
        primary,
        subtype,
        params,
    }
}

/// Case-insensitive lookup of a `name=value` parameter in any
/// semicolon-separated header value; quotes are stripped.
#[must_use]
pub fn extract_header_param(value: &str, name: &str) -> Option<String> {
    for segment in value.split(';') {
        if let Some((n, v)) = segment.split_once('=')
            && n.trim().eq_ignore_ascii_case(name)
        {
            return Some(strip_quotes(v).to_string());
        }
    }
    None
}

/// The `boundary` parameter of a Content-Type value.
#[must_use]
pub fn extract_boundary(content_type: &str) -> Option<String> {
    extract_header_param(content_type, "boundary")
}

/// A node of a parsed MIME entity.
#[derive(Debug, Clone)]
pub struct MimePart {
    pub headers: HeaderMap,
    pub content_type: ContentType,
    pub body: MimeBody,
}

#[derive(Debug, Clone)]
pub enum MimeBody {
    /// Decoded leaf content.
    Leaf(Vec<u8>),
    /// Children of a multipart entity.
    Multipart(Vec<MimePart>),
}

/// Find the blank line separating headers from body.
fn split_at_blank_line(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut i = 0;
    while i < raw.len() {
        if raw[i..].starts_with(b"\r\n\r\n") {
            return (&raw[..i], &raw[i + 4..]);
        }
        if raw[i..].starts_with(b"\n\n") {
            return (&raw[..i], &raw[i + 2..]);
        }
        i += 1;
    }
    (raw, b"")
}

/// Parse one RFC 2822 entity: headers, then either a recursive
/// multipart split or a content-transfer-decoded leaf body. A body
/// whose declared encoding fails to decode is kept raw.
#[must_use]
pub fn parse_mime_part(raw: &[u8]) -> MimePart {
    let (head, body) = split_at_blank_line(raw);
    let headers = parse_headers(&String::from_utf8_lossy(head));
    let content_type = headers
        .get("content-type")
        .map(parse_content_type)
        .unwrap_or_default();

    if content_type.is_multipart()
        && let Some(boundary) = content_type.param("boundary")
    {
        let children = split_multipart_body(body, boundary)
            .iter()
            .map(|segment| parse_mime_part(segment))
            .collect();
        return MimePart {
            headers,
            content_type,
            body: MimeBody::Multipart(children),
        };
    }

    let encoding = headers.get("content-transfer-encoding").unwrap_or("");
    let decoded = decode_content(body, encoding).unwrap_or_else(|_| body.to_vec());
    MimePart {
        headers,
        content_type,
        body: MimeBody::Leaf(decoded),
    }
}

/// Flatten a MIME tree into leaf parts addressed by IMAP part numbers
/// (`1`, `1.1`, `2`, ...). A non-multipart root yields a single part
/// named `TEXT`.
#[must_use]
pub fn flatten_mime_parts(root: &MimePart) -> Vec<MessagePart> {
    match &root.body {
        MimeBody::Leaf(bytes) => vec![MessagePart {
            which: "TEXT".to_string(),
            size: bytes.len(),
            body: bytes.clone(),
        }],
        MimeBody::Multipart(children) => {
            let mut parts = Vec::new();
            for (index, child) in children.iter().enumerate() {
                flatten_into(child, (index + 1).to_string(), &mut parts);
            }
            parts
        }
    }
}

fn flatten_into(part: &MimePart, number: String, out: &mut Vec<MessagePart>) {
    match &part.body {
        MimeBody::Leaf(bytes) => out.push(MessagePart {
            which: number,
            size: bytes.len(),
            body: bytes.clone(),
        }),
        MimeBody::Multipart(children) => {
            for (index, child) in children.iter().enumerate() {
                flatten_into(child, format!("{number}.{}", index + 1), out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfolding() {
        assert_eq!(
            unfold_headers("Subject: a\r\n continued\r\nTo: b"),
            "Subject: a continued\r\nTo: b"
        );
        assert_eq!(unfold_headers("X: a\n\tb"), "X: a b");
        assert_eq!(unfold_headers("X: plain"), "X: plain");
    }

    #[test]
    fn header_parse_lowercases_and_decodes() {
        let map = parse_headers(
            "Subject: =?utf-8?Q?caf=C3=A9?=\r\nFrom: a@example.com\r\nX-Long: one\r\n two",
        );
        assert_eq!(map.get("subject"), Some("café"));
        assert_eq!(map.get("SUBJECT"), Some("café"));
        assert_eq!(map.get("from"), Some("a@example.com"));
        assert_eq!(map.get("x-long"), Some("one two"));
    }

    #[test]
    fn duplicate_headers_accumulate() {
        let map = parse_headers("Received: one\r\nReceived: two\r\nReceived: three");
        assert_eq!(map.get("received"), Some("one"));
        assert_eq!(map.get_all("received"), vec!["one", "two", "three"]);
    }

    #[test]
    fn content_type_parse() {
        let ct = parse_content_type("multipart/Mixed; boundary=\"=_frontier\"; charset=utf-8");
        assert_eq!(ct.primary, "multipart");
        assert_eq!(ct.subtype, "mixed");
        assert!(ct.is_multipart());
        assert_eq!(ct.param("boundary"), Some("=_frontier"));
        assert_eq!(ct.param("CHARSET"), Some("utf-8"));
        assert_eq!(ct.essence(), "multipart/mixed");
    }

    #[test]
    fn header_param_extraction() {
        let value = "attachment; filename=\"report.pdf\"";
        assert_eq!(
            extract_header_param(value, "filename").as_deref(),
            Some("report.pdf")
        );
        assert_eq!(extract_header_param(value, "name"), None);
        assert_eq!(
            extract_boundary("multipart/mixed; Boundary=abc").as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn simple_message_parse() {
        let raw = b"Content-Type: text/plain; charset=utf-8\r\n\
                    Content-Transfer-Encoding: quoted-printable\r\n\
                    \r\n\
                    caf=C3=A9";
        let part = parse_mime_part(raw);
        assert_eq!(part.content_type.essence(), "text/plain");
        match &part.body {
            MimeBody::Leaf(bytes) => assert_eq!(bytes, "café".as_bytes()),
            MimeBody::Multipart(_) => panic!("expected leaf"),
        }
    }

    #[test]
    fn multipart_message_parse_and_flatten() {
        let raw = b"From: a@example.com\r\n\
                    Content-Type: multipart/mixed; boundary=outer\r\n\
                    \r\n\
                    --outer\r\n\
                    Content-Type: multipart/alternative; boundary=inner\r\n\
                    \r\n\
                    --inner\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    plain body\r\n\
                    --inner\r\n\
                    Content-Type: text/html\r\n\
                    \r\n\
                    <p>html body</p>\r\n\
                    --inner--\r\n\
                    --outer\r\n\
                    Content-Type: application/octet-stream\r\n\
                    Content-Transfer-Encoding: base64\r\n\
                    \r\n\
                    SGVsbG8NCldvcmxk\r\n\
                    --outer--\r\n";
        let part = parse_mime_part(raw);
        let flat = flatten_mime_parts(&part);
        let numbers: Vec<&str> = flat.iter().map(|p| p.which.as_str()).collect();
        assert_eq!(numbers, vec!["1.1", "1.2", "2"]);
        assert_eq!(flat[0].body, b"plain body");
        assert_eq!(flat[1].body, b"<p>html body</p>");
        assert_eq!(flat[2].body, b"Hello\r\nWorld");
        assert_eq!(flat[2].size, 12);
    }

    #[test]
    fn non_multipart_root_flattens_to_text() {
        let part = parse_mime_part(b"Content-Type: text/plain\r\n\r\nhi");
        let flat = flatten_mime_parts(&part);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].which, "TEXT");
        assert_eq!(flat[0].body, b"hi");
    }

    #[test]
    fn missing_content_type_defaults_to_text_plain() {
        let part = parse_mime_part(b"X-Other: y\r\n\r\nbody");
        assert_eq!(part.content_type.essence(), "text/plain");
    }
}
