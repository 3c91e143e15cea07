//! Multipart body splitting (RFC 2046 section 5.1)

/// Split a multipart body at its `--boundary` delimiter lines.
///
/// Returns the enclosed parts in order. The preamble before the first
/// delimiter and the epilogue after the closing `--boundary--` are
/// discarded, and the line break that precedes each delimiter is
/// stripped from the part it terminates. Works with CRLF or bare LF
/// line endings.
#[must_use]
pub fn split_multipart_body(body: &[u8], boundary: &str) -> Vec<Vec<u8>> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut parts = Vec::new();
    let mut part_start: Option<usize> = None;
    let mut pos = 0;

    while pos <= body.len() {
        let line_end = memchr::memchr(b'\n', &body[pos..]).map(|i| pos + i);
        let end = line_end.unwrap_or(body.len());
        let mut line = &body[pos..end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }

        if let Some(rest) = line.strip_prefix(delimiter.as_slice()) {
            let trimmed: &[u8] = {
                let mut r = rest;
                while matches!(r.last(), Some(b' ' | b'\t')) {
                    r = &r[..r.len() - 1];
                }
                r
            };
            let closing = trimmed == b"--";
            if trimmed.is_empty() || closing {
                if let Some(start) = part_start {
                    parts.push(strip_trailing_eol(&body[start..pos]).to_vec());
                }
                if closing {
                    return parts;
                }
                part_start = Some(end + 1);
            }
        }

        match line_end {
            Some(e) => pos = e + 1,
            None => break,
        }
    }

    // Missing closing delimiter: keep what accumulated.
    if let Some(start) = part_start
        && start <= body.len()
    {
        parts.push(strip_trailing_eol(&body[start..]).to_vec());
    }
    parts
}

fn strip_trailing_eol(segment: &[u8]) -> &[u8] {
    if segment.ends_with(b"\r\n") {
        &segment[..segment.len() - 2]
    } else if segment.ends_with(b"\n") {
        &segment[..segment.len() - 1]
    } else {
        segment
    }
}
