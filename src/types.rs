//! Public data model
//!
//! Strongly-typed values exchanged with the session facade: message
//! flags, mailbox status, fetched messages, search criteria, fetch
//! options, and the capability set.

use chrono::NaiveDate;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

/// An IMAP message flag.
///
/// System flags (prefixed with `\` in the IMAP protocol) have
/// dedicated variants. User-defined keyword flags use [`Flag::Keyword`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Flag {
    /// Message has been read (`\Seen`).
    Seen,
    /// Message has been answered (`\Answered`).
    Answered,
    /// Message is flagged for attention (`\Flagged`).
    Flagged,
    /// Message is marked for deletion (`\Deleted`).
    Deleted,
    /// Message is a draft (`\Draft`).
    Draft,
    /// Message arrived since the last session (`\Recent`).
    Recent,
    /// A user-defined keyword flag (no `\` prefix).
    Keyword(String),
}

impl Flag {
    /// The IMAP wire representation of this flag.
    ///
    /// System flags include the leading backslash (e.g. `\Seen`).
    /// Keyword flags are returned as-is.
    #[must_use]
    pub fn as_imap_str(&self) -> &str {
        match self {
            Self::Seen => "\\Seen",
            Self::Answered => "\\Answered",
            Self::Flagged => "\\Flagged",
            Self::Deleted => "\\Deleted",
            Self::Draft => "\\Draft",
            Self::Recent => "\\Recent",
            Self::Keyword(kw) => kw,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_imap_str())
    }
}

impl From<&str> for Flag {
    fn from(s: &str) -> Self {
        match s {
            "\\Seen" => Self::Seen,
            "\\Answered" => Self::Answered,
            "\\Flagged" => Self::Flagged,
            "\\Deleted" => Self::Deleted,
            "\\Draft" => Self::Draft,
            "\\Recent" => Self::Recent,
            other => Self::Keyword(other.to_string()),
        }
    }
}

/// Message counters reported by SELECT/EXAMINE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessageCounts {
    /// EXISTS count.
    pub total: u32,
    /// RECENT count.
    pub new: u32,
    /// First-unseen hint from `[UNSEEN n]`, 0 when absent.
    pub unseen: u32,
}

/// State of the currently selected mailbox.
///
/// Produced by `open_box`; the EXISTS/EXPUNGE traffic that arrives
/// while the mailbox stays selected mutates the counters; the next
/// `open_box` replaces the whole value.
#[derive(Debug, Clone, Serialize)]
pub struct Mailbox {
    pub name: String,
    pub read_only: bool,
    pub uid_validity: u32,
    pub uid_next: u32,
    pub flags: Vec<String>,
    pub permanent_flags: Vec<String>,
    /// CONDSTORE highest modification sequence; `None` on NOMODSEQ
    /// servers.
    pub highest_modseq: Option<u64>,
    pub messages: MessageCounts,
}

impl Mailbox {
    pub(crate) fn empty(name: impl Into<String>, read_only: bool) -> Self {
        Self {
            name: name.into(),
            read_only,
            uid_validity: 0,
            uid_next: 0,
            flags: Vec::new(),
            permanent_flags: Vec::new(),
            highest_modseq: None,
            messages: MessageCounts::default(),
        }
    }
}

/// One body section returned by FETCH.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePart {
    /// The section name the server echoed, without the surrounding
    /// brackets: `HEADER`, `TEXT`, `1.2`, `HEADER.FIELDS (FROM)`, or
    /// empty for the whole message.
    pub which: String,
    pub size: usize,
    pub body: Vec<u8>,
}

impl MessagePart {
    /// The body as text, lossily decoded.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// An address from an ENVELOPE response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{name} <")?;
        }
        write!(
            f,
            "{}@{}",
            self.mailbox.as_deref().unwrap_or(""),
            self.host.as_deref().unwrap_or("")
        )?;
        if self.name.is_some() {
            write!(f, ">")?;
        }
        Ok(())
    }
}

/// Parsed ENVELOPE structure (RFC 3501 section 7.4.2).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

/// Parsed BODYSTRUCTURE node.
///
/// Multipart nodes have `primary == "multipart"` and children in
/// `parts`; leaf nodes carry encoding and size.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BodyStructure {
    pub primary: String,
    pub subtype: String,
    pub params: Vec<(String, String)>,
    pub id: Option<String>,
    pub description: Option<String>,
    pub encoding: Option<String>,
    pub size: Option<u32>,
    pub parts: Vec<BodyStructure>,
}

/// One fetched message.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub seqno: u32,
    pub uid: u32,
    pub flags: Vec<String>,
    /// INTERNALDATE, verbatim as the server sent it.
    pub internal_date: Option<String>,
    /// RFC822.SIZE.
    pub size: Option<u32>,
    /// CONDSTORE modification sequence.
    pub modseq: Option<u64>,
    pub envelope: Option<Envelope>,
    pub body_structure: Option<BodyStructure>,
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub(crate) fn new(seqno: u32) -> Self {
        Self {
            seqno,
            uid: 0,
            flags: Vec::new(),
            internal_date: None,
            size: None,
            modseq: None,
            envelope: None,
            body_structure: None,
            parts: Vec::new(),
        }
    }

    /// Find a body part by a case-insensitive substring match on its
    /// section name. Servers may echo `BODY[HEADER.FIELDS (FROM)]` for
    /// a request of `BODY[HEADER]`, so `part("HEADER")` matches both.
    #[must_use]
    pub fn part(&self, which: &str) -> Option<&MessagePart> {
        let needle = which.to_uppercase();
        self.parts
            .iter()
            .find(|p| p.which.to_uppercase().contains(&needle))
    }
}

/// A body section to request in a FETCH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodySection {
    /// `BODY[HEADER]`.
    Header,
    /// `BODY[TEXT]`.
    Text,
    /// `BODY[]` — the entire message.
    Entire,
    /// A verbatim section spec: a part number like `1.2`, or
    /// `HEADER.FIELDS (FROM SUBJECT)`.
    Section(String),
}

impl BodySection {
    /// The text between the brackets of `BODY[...]`.
    #[must_use]
    pub fn as_section_str(&self) -> &str {
        match self {
            Self::Header => "HEADER",
            Self::Text => "TEXT",
            Self::Entire => "",
            Self::Section(s) => s,
        }
    }
}

impl From<&str> for BodySection {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "HEADER" => Self::Header,
            "TEXT" => Self::Text,
            "" | "FULL" => Self::Entire,
            _ => Self::Section(s.to_string()),
        }
    }
}

/// What a FETCH should retrieve besides UID and FLAGS.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub bodies: Vec<BodySection>,
    /// Request BODYSTRUCTURE.
    pub structure: bool,
    /// Request ENVELOPE.
    pub envelope: bool,
    /// Request RFC822.SIZE.
    pub size: bool,
    /// Use `BODY[...]` instead of `BODY.PEEK[...]`, letting the server
    /// set `\Seen`.
    pub mark_seen: bool,
    /// Request MODSEQ (CONDSTORE).
    pub modseq: bool,
    /// Append `(CHANGEDSINCE n)` (CONDSTORE).
    pub changed_since: Option<u64>,
}

impl FetchOptions {
    /// Fetch the named body sections, unmarked.
    #[must_use]
    pub fn bodies(sections: &[&str]) -> Self {
        Self {
            bodies: sections.iter().map(|s| BodySection::from(*s)).collect(),
            ..Self::default()
        }
    }
}

/// One RFC 3501 SEARCH key.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchCriterion {
    All,
    Answered,
    Unanswered,
    Deleted,
    Undeleted,
    Draft,
    Undraft,
    Flagged,
    Unflagged,
    Seen,
    Unseen,
    New,
    Old,
    Recent,
    From(String),
    To(String),
    Cc(String),
    Bcc(String),
    Subject(String),
    Body(String),
    Text(String),
    Since(NaiveDate),
    Before(NaiveDate),
    On(NaiveDate),
    SentSince(NaiveDate),
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    Larger(u32),
    Smaller(u32),
    /// A raw UID sequence-set string, e.g. `1:100,205`.
    Uid(String),
    Header(String, String),
}

/// Result of a UID SEARCH.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub uids: Vec<u32>,
    /// `(MODSEQ n)` attached by CONDSTORE servers, surfaced whether or
    /// not the caller asked for it.
    pub highest_modseq: Option<u64>,
}

/// A mailbox entry from LIST/LSUB.
#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub attributes: Vec<String>,
    pub delimiter: Option<char>,
    pub name: String,
}

/// Parameters for a QRESYNC-augmented SELECT/EXAMINE (RFC 7162).
#[derive(Debug, Clone)]
pub struct QresyncParams {
    pub uid_validity: u32,
    pub last_known_modseq: u64,
    /// Optional known-UIDs set string.
    pub known_uids: Option<String>,
    /// Optional `(seq_set uid_set)` sequence-match hint.
    pub sequence_match: Option<(String, String)>,
}

/// Result of `open_box_with_qresync`.
#[derive(Debug, Clone)]
pub struct QresyncOpen {
    pub mailbox: Mailbox,
    /// Union of the UIDs from every VANISHED line in the SELECT batch.
    pub vanished: Vec<u32>,
    /// True if any VANISHED line carried the `(EARLIER)` prefix.
    pub vanished_earlier: bool,
}

/// Server capability set: stored uppercase, queried case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    set: HashSet<String>,
    known: bool,
}

impl Capabilities {
    /// Replace the whole set (after a greeting code, auth OK code, or
    /// explicit CAPABILITY).
    pub fn replace<I, S>(&mut self, caps: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.set = caps
            .into_iter()
            .map(|c| c.as_ref().to_uppercase())
            .collect();
        self.known = true;
    }

    /// Whether any capability data has been received yet.
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.known
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.set.contains(&name.to_uppercase())
    }

    /// All capabilities, unordered.
    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.set.iter().map(String::as_str)
    }
}

/// Format an ordered UID list as an IMAP sequence-set string.
#[must_use]
pub fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_flags() {
        assert_eq!(Flag::Seen.as_imap_str(), "\\Seen");
        assert_eq!(Flag::Deleted.as_imap_str(), "\\Deleted");
        assert_eq!(Flag::from("\\Answered"), Flag::Answered);
        assert_eq!(
            Flag::from("$Important"),
            Flag::Keyword("$Important".to_string())
        );
    }

    #[test]
    fn body_section_mapping() {
        assert_eq!(BodySection::from("HEADER"), BodySection::Header);
        assert_eq!(BodySection::from("header"), BodySection::Header);
        assert_eq!(BodySection::from(""), BodySection::Entire);
        assert_eq!(BodySection::from("FULL"), BodySection::Entire);
        assert_eq!(
            BodySection::from("1.2"),
            BodySection::Section("1.2".to_string())
        );
    }

    #[test]
    fn capabilities_case_insensitive() {
        let mut caps = Capabilities::default();
        assert!(!caps.is_known());
        caps.replace(["IMAP4rev1", "idle", "Condstore"]);
        assert!(caps.is_known());
        assert!(caps.has("IDLE"));
        assert!(caps.has("idle"));
        assert!(caps.has("CONDSTORE"));
        assert!(!caps.has("QRESYNC"));
    }

    #[test]
    fn message_part_lookup_is_substring_match() {
        let mut msg = Message::new(1);
        msg.parts.push(MessagePart {
            which: "HEADER.FIELDS (FROM SUBJECT)".to_string(),
            size: 0,
            body: Vec::new(),
        });
        assert!(msg.part("header").is_some());
        assert!(msg.part("TEXT").is_none());
    }

    #[test]
    fn uid_set_joins_with_commas() {
        assert_eq!(uid_set(&[2, 84, 882]), "2,84,882");
        assert_eq!(uid_set(&[]), "");
    }
}
