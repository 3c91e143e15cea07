//! Response-grammar parser
//!
//! Classifies server lines as tagged, untagged, or continuation, and
//! decodes the known untagged forms (EXISTS, FETCH, LIST, SEARCH,
//! CAPABILITY, FLAGS, VANISHED, status responses with bracketed
//! codes). Input is a logical line assembled by the engine: the text
//! keeps its `{n}` markers while the literal octets travel alongside
//! in order of appearance.

use crate::error::{Error, Result};
use crate::tokenizer::{Token, tokenize};
use crate::types::{Address, BodyStructure, Envelope, ListEntry, Mailbox, Message, MessagePart, SearchResult};
use tracing::warn;

/// A complete logical line: text with `{n}` markers intact, literal
/// payloads in marker order.
#[derive(Debug, Clone, Default)]
pub struct ResponseLine {
    pub text: String,
    pub literals: Vec<Vec<u8>>,
}

impl ResponseLine {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            literals: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_literals(text: impl Into<String>, literals: Vec<Vec<u8>>) -> Self {
        Self {
            text: text.into(),
            literals,
        }
    }
}

/// Coarse shape of one server line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Tagged,
    Untagged,
    Continuation,
}

#[must_use]
pub fn classify_line(line: &str) -> LineKind {
    if line.starts_with('+') {
        LineKind::Continuation
    } else if line.starts_with('*') {
        LineKind::Untagged
    } else {
        LineKind::Tagged
    }
}

/// Completion status of a tagged response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

impl Status {
    fn parse(word: &str) -> Option<Self> {
        if word.eq_ignore_ascii_case("OK") {
            Some(Self::Ok)
        } else if word.eq_ignore_ascii_case("NO") {
            Some(Self::No)
        } else if word.eq_ignore_ascii_case("BAD") {
            Some(Self::Bad)
        } else {
            None
        }
    }
}

/// `<tag> OK|NO|BAD <text>`. The text keeps any `[CODE ...]` prefix.
#[derive(Debug, Clone)]
pub struct TaggedResponse {
    pub tag: String,
    pub status: Status,
    pub text: String,
}

/// A server emission prefixed with `*`.
#[derive(Debug, Clone)]
pub struct UntaggedResponse {
    /// Uppercased atom: EXISTS, FETCH, SEARCH, LIST, OK, VANISHED, ...
    pub kind: String,
    pub data: UntaggedData,
    /// The line verbatim.
    pub raw: String,
}

/// One FETCH attribute value.
#[derive(Debug, Clone)]
pub enum FetchValue {
    /// Raw atom or quoted-string text.
    Text(String),
    /// MODSEQ, normalized from a bare number or one-element list.
    Number(u64),
    /// String items of a parenthesized list (flags, etc.).
    List(Vec<String>),
    /// Literal payload paired with its `{n}` marker.
    Bytes(Vec<u8>),
    /// Token tree kept for ENVELOPE / BODYSTRUCTURE interpretation.
    Structured(Vec<Token>),
    Nil,
}

#[derive(Debug, Clone)]
pub enum UntaggedData {
    /// `* N EXISTS`-style numeric responses.
    Count { number: u32, extra: Option<String> },
    /// `* N FETCH (...)`.
    Fetch {
        seqno: u32,
        attributes: Vec<(String, FetchValue)>,
    },
    /// `* SEARCH uid uid ... [(MODSEQ n)]`.
    Search {
        uids: Vec<u32>,
        highest_modseq: Option<u64>,
    },
    /// `* LIST (\Flags) "/" name` (also LSUB).
    List {
        attributes: Vec<String>,
        delimiter: Option<char>,
        name: String,
    },
    /// `* CAPABILITY ...`, in server order.
    Capability(Vec<String>),
    /// `* OK|NO|BAD|BYE|PREAUTH [code] text`.
    Status {
        code: Option<String>,
        text: String,
    },
    /// `* VANISHED [(EARLIER)] seq-set`, ranges expanded.
    Vanished { earlier: bool, uids: Vec<u32> },
    /// `* FLAGS (...)`.
    Flags(Vec<String>),
    /// Fall-through: anything else, unparsed.
    Text(String),
}

/// Split at the first space; the remainder has leading spaces trimmed.
fn split_word(s: &str) -> (&str, &str) {
    match s.find(' ') {
        Some(i) => (&s[..i], s[i + 1..].trim_start()),
        None => (s, ""),
    }
}

/// Leading `[code]` of a response text, if present.
pub(crate) fn bracket_code(text: &str) -> Option<&str> {
    let rest = text.trim_start();
    if !rest.starts_with('[') {
        return None;
    }
    rest.find(']').map(|end| &rest[1..end])
}

#[must_use]
pub fn parse_tagged(line: &str) -> TaggedResponse {
    let (tag, rest) = split_word(line);
    let (status_word, text) = split_word(rest);
    match Status::parse(status_word) {
        Some(status) => TaggedResponse {
            tag: tag.to_string(),
            status,
            text: text.to_string(),
        },
        // Malformed tagged line: report BAD and keep the remainder.
        None => TaggedResponse {
            tag: tag.to_string(),
            status: Status::Bad,
            text: rest.to_string(),
        },
    }
}

pub fn parse_untagged(line: &ResponseLine) -> Result<UntaggedResponse> {
    let raw = line.text.clone();
    let rest = line
        .text
        .strip_prefix('*')
        .ok_or_else(|| Error::parse("untagged response must start with '*'", line.text.as_str()))?
        .trim_start();
    if rest.is_empty() {
        return Err(Error::parse("empty untagged response", line.text.as_str()));
    }

    let (first, remainder) = split_word(rest);

    // `* N TYPE ...` numeric prefix.
    if let Ok(number) = first.parse::<u32>() {
        let (kind_word, extra) = split_word(remainder);
        let kind = kind_word.to_uppercase();
        if kind == "FETCH" {
            let attributes = parse_fetch_attributes(extra, &line.literals)?;
            return Ok(UntaggedResponse {
                kind,
                data: UntaggedData::Fetch {
                    seqno: number,
                    attributes,
                },
                raw,
            });
        }
        return Ok(UntaggedResponse {
            kind,
            data: UntaggedData::Count {
                number,
                extra: (!extra.is_empty()).then(|| extra.to_string()),
            },
            raw,
        });
    }

    let kind = first.to_uppercase();
    let data = match kind.as_str() {
        "OK" | "NO" | "BAD" | "BYE" | "PREAUTH" => {
            let code = bracket_code(remainder).map(str::to_string);
            let text = if code.is_some() {
                remainder[remainder.find(']').map_or(0, |i| i + 1)..]
                    .trim_start()
                    .to_string()
            } else {
                remainder.to_string()
            };
            UntaggedData::Status { code, text }
        }
        "CAPABILITY" => {
            UntaggedData::Capability(remainder.split_whitespace().map(str::to_string).collect())
        }
        "FLAGS" => UntaggedData::Flags(first_list_strings(remainder)),
        "LIST" | "LSUB" => parse_list_data(remainder, &line.literals)?,
        "SEARCH" => parse_search_data(remainder)?,
        "VANISHED" => parse_vanished_data(remainder)?,
        _ => UntaggedData::Text(remainder.to_string()),
    };

    Ok(UntaggedResponse { kind, data, raw })
}

/// String items of the first parenthesized list in `input`.
fn first_list_strings(input: &str) -> Vec<String> {
    let (tokens, _) = tokenize(input);
    for token in tokens {
        if let Token::List(items) = token {
            return items
                .iter()
                .filter_map(|t| t.text().map(str::to_string))
                .collect();
        }
    }
    Vec::new()
}

fn parse_list_data(remainder: &str, literals: &[Vec<u8>]) -> Result<UntaggedData> {
    let (tokens, _) = tokenize(remainder);
    let mut iter = tokens.into_iter();

    let attributes = match iter.next() {
        Some(Token::List(items)) => items
            .iter()
            .filter_map(|t| t.text().map(str::to_string))
            .collect(),
        _ => return Err(Error::parse("LIST response missing attribute list", remainder)),
    };
    let delimiter = match iter.next() {
        Some(Token::Nil) | None => None,
        Some(Token::Quoted(s) | Token::Atom(s)) => s.chars().next(),
        Some(other) => {
            return Err(Error::parse(
                format!("unexpected LIST delimiter token {other:?}"),
                remainder,
            ));
        }
    };
    let name = match iter.next() {
        Some(Token::Quoted(s) | Token::Atom(s)) => s,
        Some(Token::Literal(_)) => literals
            .first()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| Error::parse("LIST name literal missing its payload", remainder))?,
        _ => return Err(Error::parse("LIST response missing mailbox name", remainder)),
    };

    Ok(UntaggedData::List {
        attributes,
        delimiter,
        name,
    })
}

fn parse_search_data(remainder: &str) -> Result<UntaggedData> {
    let (tokens, _) = tokenize(remainder);
    let mut uids = Vec::new();
    let mut highest_modseq = None;
    for token in tokens {
        match token {
            Token::Atom(s) => {
                let uid = s.parse::<u32>().map_err(|_| {
                    Error::parse(format!("SEARCH result '{s}' is not a number"), remainder)
                })?;
                uids.push(uid);
            }
            Token::List(items) => {
                // Trailing `(MODSEQ n)` under CONDSTORE.
                let is_modseq = items
                    .first()
                    .and_then(Token::text)
                    .is_some_and(|t| t.eq_ignore_ascii_case("MODSEQ"));
                if is_modseq {
                    highest_modseq = items.get(1).and_then(Token::number);
                }
            }
            _ => {}
        }
    }
    Ok(UntaggedData::Search {
        uids,
        highest_modseq,
    })
}

fn parse_vanished_data(remainder: &str) -> Result<UntaggedData> {
    let mut rest = remainder.trim();
    let mut earlier = false;
    if rest.to_uppercase().starts_with("(EARLIER)") {
        earlier = true;
        rest = rest["(EARLIER)".len()..].trim_start();
    }
    let uids = expand_sequence_set(rest)?;
    Ok(UntaggedData::Vanished { earlier, uids })
}

/// Expand `a:b,c` into an ordered UID list. Ranges are inclusive in
/// both directions: `302:300` covers the same closed interval as
/// `300:302`. `*` endpoints are refused rather than expanded.
pub fn expand_sequence_set(set: &str) -> Result<Vec<u32>> {
    let mut uids = Vec::new();
    for part in set.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once(':') {
            Some((a, b)) => {
                let a: u32 = parse_seq_number(a, set)?;
                let b: u32 = parse_seq_number(b, set)?;
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                uids.extend(lo..=hi);
            }
            None => uids.push(parse_seq_number(part, set)?),
        }
    }
    Ok(uids)
}

fn parse_seq_number(text: &str, raw: &str) -> Result<u32> {
    text.parse()
        .map_err(|_| Error::parse(format!("sequence-set element '{text}' is not a number"), raw))
}

/// Replace `Literal` tokens with quoted text resolved from the literal
/// queue, recursively, so ENVELOPE/BODYSTRUCTURE trees are
/// self-contained.
fn resolve_literals<'a, I>(tokens: Vec<Token>, literals: &mut I) -> Vec<Token>
where
    I: Iterator<Item = &'a Vec<u8>>,
{
    tokens
        .into_iter()
        .map(|token| match token {
            Token::Literal(_) => match literals.next() {
                Some(bytes) => Token::Quoted(String::from_utf8_lossy(bytes).into_owned()),
                None => Token::Nil,
            },
            Token::List(items) => Token::List(resolve_literals(items, literals)),
            other => other,
        })
        .collect()
}

/// Uppercase a FETCH key up to any `[`; the section suffix stays
/// verbatim so the caller sees the exact form the server echoed.
fn normalize_key(key: &str) -> String {
    match key.find('[') {
        Some(i) => format!("{}{}", key[..i].to_uppercase(), &key[i..]),
        None => key.to_uppercase(),
    }
}

/// Walk the `( key value ... )` pairs of a FETCH response.
pub fn parse_fetch_attributes(
    input: &str,
    literals: &[Vec<u8>],
) -> Result<Vec<(String, FetchValue)>> {
    let (tokens, _) = tokenize(input);
    let items = match tokens.into_iter().next() {
        Some(Token::List(items)) => items,
        _ => {
            return Err(Error::parse(
                "FETCH attributes must be a parenthesized list",
                input,
            ));
        }
    };

    let mut lits = literals.iter();
    let mut attributes = Vec::new();
    let mut iter = items.into_iter();
    while let Some(key_token) = iter.next() {
        let key_raw = match key_token {
            Token::Atom(atom) => atom,
            other => {
                return Err(Error::parse(
                    format!("FETCH attribute key must be an atom, got {other:?}"),
                    input,
                ));
            }
        };
        let key = normalize_key(&key_raw);
        let Some(value_token) = iter.next() else {
            return Err(Error::parse(
                format!("FETCH attribute '{key}' has no value"),
                input,
            ));
        };

        let value = if matches!(key.as_str(), "ENVELOPE" | "BODYSTRUCTURE" | "BODY") {
            let tree = match value_token {
                Token::List(items) => items,
                other => vec![other],
            };
            FetchValue::Structured(resolve_literals(tree, &mut lits))
        } else {
            match value_token {
                Token::Nil => FetchValue::Nil,
                Token::List(list_items) => {
                    if key == "MODSEQ" {
                        let n = list_items.first().and_then(Token::number).ok_or_else(|| {
                            Error::parse("MODSEQ value is not a number", input)
                        })?;
                        FetchValue::Number(n)
                    } else {
                        FetchValue::List(
                            list_items
                                .iter()
                                .filter_map(|t| t.text().map(str::to_string))
                                .collect(),
                        )
                    }
                }
                Token::Literal(declared) => {
                    let bytes = lits.next().cloned().ok_or_else(|| {
                        Error::parse(
                            format!("literal payload of {declared} octets was not delivered"),
                            input,
                        )
                    })?;
                    FetchValue::Bytes(bytes)
                }
                Token::Quoted(s) => FetchValue::Text(s),
                Token::Atom(s) => {
                    if key == "MODSEQ" {
                        let n = s.parse().map_err(|_| {
                            Error::parse("MODSEQ value is not a number", input)
                        })?;
                        FetchValue::Number(n)
                    } else {
                        FetchValue::Text(s)
                    }
                }
            }
        };
        attributes.push((key, value));
    }
    Ok(attributes)
}

/// Fold a SELECT/EXAMINE untagged batch plus the tagged completion
/// text into a Mailbox.
pub fn parse_select_response(
    untagged: &[UntaggedResponse],
    tagged_text: &str,
    name: &str,
    read_only: bool,
) -> Result<Mailbox> {
    let mut mailbox = Mailbox::empty(name, read_only);
    for response in untagged {
        match (&response.data, response.kind.as_str()) {
            (UntaggedData::Count { number, .. }, "EXISTS") => {
                mailbox.messages.total = *number;
            }
            (UntaggedData::Count { number, .. }, "RECENT") => {
                mailbox.messages.new = *number;
            }
            (UntaggedData::Flags(flags), _) => {
                mailbox.flags = flags.clone();
            }
            (UntaggedData::Status {
                code: Some(code), ..
            }, "OK") => {
                apply_select_code(&mut mailbox, code)?;
            }
            _ => {}
        }
    }
    if let Some(code) = bracket_code(tagged_text) {
        apply_select_code(&mut mailbox, code)?;
    }
    Ok(mailbox)
}

fn apply_select_code(mailbox: &mut Mailbox, code: &str) -> Result<()> {
    let (word, rest) = split_word(code);
    match word.to_uppercase().as_str() {
        "UIDVALIDITY" => mailbox.uid_validity = parse_code_number(rest, code)?,
        "UIDNEXT" => mailbox.uid_next = parse_code_number(rest, code)?,
        "UNSEEN" => mailbox.messages.unseen = parse_code_number(rest, code)?,
        "HIGHESTMODSEQ" => mailbox.highest_modseq = Some(parse_code_number(rest, code)?),
        "NOMODSEQ" => mailbox.highest_modseq = None,
        "PERMANENTFLAGS" => mailbox.permanent_flags = first_list_strings(rest),
        "READ-WRITE" => mailbox.read_only = false,
        "READ-ONLY" => mailbox.read_only = true,
        _ => {}
    }
    Ok(())
}

fn parse_code_number<T: std::str::FromStr>(rest: &str, code: &str) -> Result<T> {
    rest.split_whitespace()
        .next()
        .and_then(|w| w.parse().ok())
        .ok_or_else(|| Error::parse(format!("response code '{code}' carries no number"), code))
}

/// Fold LIST/LSUB untagged data into entries.
#[must_use]
pub fn parse_list_response(untagged: &[UntaggedResponse]) -> Vec<ListEntry> {
    untagged
        .iter()
        .filter_map(|response| match &response.data {
            UntaggedData::List {
                attributes,
                delimiter,
                name,
            } => Some(ListEntry {
                attributes: attributes.clone(),
                delimiter: *delimiter,
                name: name.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Fold SEARCH untagged data; multiple SEARCH lines concatenate.
#[must_use]
pub fn parse_search_response(untagged: &[UntaggedResponse]) -> SearchResult {
    let mut result = SearchResult::default();
    for response in untagged {
        if let UntaggedData::Search {
            uids,
            highest_modseq,
        } = &response.data
        {
            result.uids.extend_from_slice(uids);
            if highest_modseq.is_some() {
                result.highest_modseq = *highest_modseq;
            }
        }
    }
    result
}

/// Fold FETCH untagged data into messages.
pub fn parse_fetch_response(untagged: &[UntaggedResponse]) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for response in untagged {
        let UntaggedData::Fetch { seqno, attributes } = &response.data else {
            continue;
        };
        let mut message = Message::new(*seqno);
        for (key, value) in attributes {
            match (key.as_str(), value) {
                ("UID", FetchValue::Text(s)) => {
                    message.uid = s.parse().map_err(|_| {
                        Error::parse(format!("UID '{s}' is not a number"), response.raw.clone())
                    })?;
                }
                ("FLAGS", FetchValue::List(flags)) => {
                    message.flags = flags.clone();
                }
                ("INTERNALDATE", FetchValue::Text(s)) => {
                    message.internal_date = Some(s.clone());
                }
                ("RFC822.SIZE", FetchValue::Text(s)) => {
                    message.size = s.parse().ok();
                }
                ("MODSEQ", FetchValue::Number(n)) => {
                    message.modseq = Some(*n);
                }
                ("ENVELOPE", FetchValue::Structured(tokens)) => {
                    message.envelope = Some(parse_envelope(tokens));
                }
                ("BODYSTRUCTURE" | "BODY", FetchValue::Structured(tokens)) => {
                    message.body_structure = Some(parse_body_structure(tokens)?);
                }
                _ if key.starts_with("BODY[") => {
                    let which = key
                        .strip_prefix("BODY[")
                        .and_then(|k| k.strip_suffix(']'))
                        .unwrap_or(key)
                        .to_string();
                    let body = match value {
                        FetchValue::Bytes(bytes) => bytes.clone(),
                        FetchValue::Text(s) => s.clone().into_bytes(),
                        FetchValue::Nil => continue,
                        other => {
                            warn!("skipping body section '{which}' with value {other:?}");
                            continue;
                        }
                    };
                    message.parts.push(MessagePart {
                        which,
                        size: body.len(),
                        body,
                    });
                }
                _ => {}
            }
        }
        messages.push(message);
    }
    Ok(messages)
}

fn token_opt_text(token: Option<&Token>) -> Option<String> {
    token.and_then(Token::text).map(str::to_string)
}

/// `(date subject (from) (sender) (reply-to) (to) (cc) (bcc)
/// in-reply-to message-id)`.
#[must_use]
pub fn parse_envelope(tokens: &[Token]) -> Envelope {
    let address_list = |token: Option<&Token>| -> Vec<Address> {
        let Some(Token::List(entries)) = token else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| {
                let Token::List(fields) = entry else {
                    return None;
                };
                Some(Address {
                    name: token_opt_text(fields.first()),
                    // fields[1] is the obsolete source route.
                    mailbox: token_opt_text(fields.get(2)),
                    host: token_opt_text(fields.get(3)),
                })
            })
            .collect()
    };

    Envelope {
        date: token_opt_text(tokens.first()),
        subject: token_opt_text(tokens.get(1)),
        from: address_list(tokens.get(2)),
        sender: address_list(tokens.get(3)),
        reply_to: address_list(tokens.get(4)),
        to: address_list(tokens.get(5)),
        cc: address_list(tokens.get(6)),
        bcc: address_list(tokens.get(7)),
        in_reply_to: token_opt_text(tokens.get(8)),
        message_id: token_opt_text(tokens.get(9)),
    }
}

/// Parse a BODYSTRUCTURE token tree. Multipart nodes start with one or
/// more nested lists followed by the subtype; leaf nodes are the flat
/// `type subtype params id description encoding size` form.
pub fn parse_body_structure(tokens: &[Token]) -> Result<BodyStructure> {
    if tokens.is_empty() {
        return Err(Error::parse("empty BODYSTRUCTURE", ""));
    }

    if matches!(tokens[0], Token::List(_)) {
        // Multipart: children until the subtype atom.
        let mut parts = Vec::new();
        let mut index = 0;
        while let Some(Token::List(child)) = tokens.get(index) {
            parts.push(parse_body_structure(child)?);
            index += 1;
        }
        let subtype = token_opt_text(tokens.get(index)).unwrap_or_default();
        let params = tokens
            .get(index + 1)
            .map(param_pairs)
            .unwrap_or_default();
        return Ok(BodyStructure {
            primary: "multipart".to_string(),
            subtype: subtype.to_lowercase(),
            params,
            parts,
            ..BodyStructure::default()
        });
    }

    Ok(BodyStructure {
        primary: token_opt_text(tokens.first())
            .unwrap_or_default()
            .to_lowercase(),
        subtype: token_opt_text(tokens.get(1))
            .unwrap_or_default()
            .to_lowercase(),
        params: tokens.get(2).map(param_pairs).unwrap_or_default(),
        id: token_opt_text(tokens.get(3)),
        description: token_opt_text(tokens.get(4)),
        encoding: token_opt_text(tokens.get(5)),
        size: tokens.get(6).and_then(Token::number).and_then(|n| u32::try_from(n).ok()),
        parts: Vec::new(),
    })
}

/// `("name" "value" ...)` pairs from a parameter list token.
fn param_pairs(token: &Token) -> Vec<(String, String)> {
    let Token::List(items) = token else {
        return Vec::new();
    };
    items
        .chunks(2)
        .filter_map(|pair| match pair {
            [name, value] => Some((
                name.text()?.to_lowercase(),
                value.text().unwrap_or_default().to_string(),
            )),
            _ => None,
        })
        .collect()
}

/// Result of [`parse_response`].
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub tagged: Option<TaggedResponse>,
    pub untagged: Vec<UntaggedResponse>,
    pub continuation: Option<String>,
}

/// Parse a multi-line batch of responses. Used by tests and batch
/// consumers; literal reassembly is the engine's job, so lines here
/// are taken as-is.
pub fn parse_response(input: &str) -> Result<ParsedBatch> {
    let mut batch = ParsedBatch::default();
    for line in input.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        match classify_line(line) {
            LineKind::Continuation => {
                batch.continuation =
                    Some(line.strip_prefix('+').unwrap_or(line).trim_start().to_string());
            }
            LineKind::Untagged => batch.untagged.push(parse_untagged(&ResponseLine::new(line))?),
            LineKind::Tagged => batch.tagged = Some(parse_tagged(line)),
        }
    }
    Ok(batch)
}
