//! Command builder
//!
//! Pure formatting of every client command per RFC 3501 section 6,
//! plus the CONDSTORE/QRESYNC additions of RFC 7162 and the XOAUTH2
//! SASL argument. Functions return the tag-less command text; the
//! engine prepends the tag.

use crate::types::{Flag, FetchOptions, QresyncParams, SearchCriterion};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::NaiveDate;

fn is_quotable_special(b: u8) -> bool {
    matches!(
        b,
        b' ' | b'(' | b')' | b'{' | b'}' | b'[' | b']' | b'%' | b'*'
    ) || b <= 0x1f
        || b == 0x7f
}

/// Quote a string argument.
///
/// Empty strings become `""`. Strings free of specials pass through
/// bare. Strings containing only the milder specials get wrapped;
/// `"` and `\` additionally get backslash-escaped.
#[must_use]
pub fn quote_string(value: &str) -> String {
    if value.is_empty() {
        return "\"\"".to_string();
    }
    let needs_escape = value.bytes().any(|b| b == b'"' || b == b'\\');
    let needs_quote = needs_escape || value.bytes().any(is_quotable_special);
    if !needs_quote {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Always-quoted form, used for SEARCH text arguments.
fn quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// IMAP date: `D-Mon-YYYY`, no zero padding for the day.
#[must_use]
pub fn format_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

#[must_use]
pub fn login(user: &str, password: &str) -> String {
    format!("LOGIN {} {}", quote_string(user), quote_string(password))
}

/// `AUTHENTICATE XOAUTH2 base64(user=<u>\x01auth=Bearer <t>\x01\x01)`
/// as a single line.
#[must_use]
pub fn xoauth2(user: &str, access_token: &str) -> String {
    let sasl = format!("user={user}\x01auth=Bearer {access_token}\x01\x01");
    format!("AUTHENTICATE XOAUTH2 {}", BASE64.encode(sasl))
}

#[must_use]
pub fn logout() -> String {
    "LOGOUT".to_string()
}

#[must_use]
pub fn noop() -> String {
    "NOOP".to_string()
}

#[must_use]
pub fn capability() -> String {
    "CAPABILITY".to_string()
}

#[must_use]
pub fn expunge() -> String {
    "EXPUNGE".to_string()
}

#[must_use]
pub fn idle() -> String {
    "IDLE".to_string()
}

#[must_use]
pub fn list(reference: &str, pattern: &str) -> String {
    format!("LIST {} {}", quote_string(reference), quote_string(pattern))
}

#[must_use]
pub fn lsub(reference: &str, pattern: &str) -> String {
    format!("LSUB {} {}", quote_string(reference), quote_string(pattern))
}

#[must_use]
pub fn select(mailbox: &str, examine: bool) -> String {
    let verb = if examine { "EXAMINE" } else { "SELECT" };
    format!("{verb} {}", quote_string(mailbox))
}

/// SELECT/EXAMINE with the RFC 7162 QRESYNC parameter block:
/// `(QRESYNC (uidvalidity modseq [known-uids [(seq-set uid-set)]]))`.
#[must_use]
pub fn select_qresync(mailbox: &str, examine: bool, params: &QresyncParams) -> String {
    let verb = if examine { "EXAMINE" } else { "SELECT" };
    let mut inner = format!("{} {}", params.uid_validity, params.last_known_modseq);
    if let Some(known_uids) = &params.known_uids {
        inner.push(' ');
        inner.push_str(known_uids);
        if let Some((seq_set, uid_set)) = &params.sequence_match {
            inner.push_str(&format!(" ({seq_set} {uid_set})"));
        }
    }
    format!("{verb} {} (QRESYNC ({inner}))", quote_string(mailbox))
}

#[must_use]
pub fn create(mailbox: &str) -> String {
    format!("CREATE {}", quote_string(mailbox))
}

#[must_use]
pub fn delete(mailbox: &str) -> String {
    format!("DELETE {}", quote_string(mailbox))
}

#[must_use]
pub fn rename(old: &str, new: &str) -> String {
    format!("RENAME {} {}", quote_string(old), quote_string(new))
}

fn criterion(criterion: &SearchCriterion) -> String {
    use SearchCriterion as C;
    match criterion {
        C::All => "ALL".to_string(),
        C::Answered => "ANSWERED".to_string(),
        C::Unanswered => "UNANSWERED".to_string(),
        C::Deleted => "DELETED".to_string(),
        C::Undeleted => "UNDELETED".to_string(),
        C::Draft => "DRAFT".to_string(),
        C::Undraft => "UNDRAFT".to_string(),
        C::Flagged => "FLAGGED".to_string(),
        C::Unflagged => "UNFLAGGED".to_string(),
        C::Seen => "SEEN".to_string(),
        C::Unseen => "UNSEEN".to_string(),
        C::New => "NEW".to_string(),
        C::Old => "OLD".to_string(),
        C::Recent => "RECENT".to_string(),
        C::From(s) => format!("FROM {}", quoted(s)),
        C::To(s) => format!("TO {}", quoted(s)),
        C::Cc(s) => format!("CC {}", quoted(s)),
        C::Bcc(s) => format!("BCC {}", quoted(s)),
        C::Subject(s) => format!("SUBJECT {}", quoted(s)),
        C::Body(s) => format!("BODY {}", quoted(s)),
        C::Text(s) => format!("TEXT {}", quoted(s)),
        C::Since(d) => format!("SINCE {}", format_date(*d)),
        C::Before(d) => format!("BEFORE {}", format_date(*d)),
        C::On(d) => format!("ON {}", format_date(*d)),
        C::SentSince(d) => format!("SENTSINCE {}", format_date(*d)),
        C::SentBefore(d) => format!("SENTBEFORE {}", format_date(*d)),
        C::SentOn(d) => format!("SENTON {}", format_date(*d)),
        C::Larger(n) => format!("LARGER {n}"),
        C::Smaller(n) => format!("SMALLER {n}"),
        C::Uid(set) => format!("UID {set}"),
        C::Header(name, value) => format!("HEADER {} {}", quoted(name), quoted(value)),
    }
}

/// `SEARCH <criteria>`; multiple criteria join with single spaces
/// (implicit AND); an empty list searches ALL. `changed_since`
/// appends the RFC 7162 modifier.
#[must_use]
pub fn search(criteria: &[SearchCriterion], changed_since: Option<u64>) -> String {
    let keys = if criteria.is_empty() {
        "ALL".to_string()
    } else {
        criteria.iter().map(criterion).collect::<Vec<_>>().join(" ")
    };
    let mut command = format!("SEARCH {keys}");
    if let Some(modseq) = changed_since {
        command.push_str(&format!(" (CHANGEDSINCE {modseq})"));
    }
    command
}

/// `FETCH <sequence> (<items>)`. UID and FLAGS are always included;
/// body sections peek unless `mark_seen`.
#[must_use]
pub fn fetch(sequence: &str, options: &FetchOptions) -> String {
    let mut items = vec!["UID".to_string(), "FLAGS".to_string()];
    for section in &options.bodies {
        let spec = section.as_section_str();
        if options.mark_seen {
            items.push(format!("BODY[{spec}]"));
        } else {
            items.push(format!("BODY.PEEK[{spec}]"));
        }
    }
    if options.envelope {
        items.push("ENVELOPE".to_string());
    }
    if options.structure {
        items.push("BODYSTRUCTURE".to_string());
    }
    if options.size {
        items.push("RFC822.SIZE".to_string());
    }
    if options.modseq {
        items.push("MODSEQ".to_string());
    }
    let mut command = format!("FETCH {sequence} ({})", items.join(" "));
    if let Some(modseq) = options.changed_since {
        command.push_str(&format!(" (CHANGEDSINCE {modseq})"));
    }
    command
}

/// `STORE <sequence> +FLAGS (...)` to add, `-FLAGS` to remove.
#[must_use]
pub fn store(sequence: &str, add: bool, flags: &[Flag]) -> String {
    let op = if add { "+FLAGS" } else { "-FLAGS" };
    let list = flags
        .iter()
        .map(Flag::as_imap_str)
        .collect::<Vec<_>>()
        .join(" ");
    format!("STORE {sequence} {op} ({list})")
}

#[must_use]
pub fn copy(sequence: &str, mailbox: &str) -> String {
    format!("COPY {sequence} {}", quote_string(mailbox))
}

/// Native MOVE (RFC 6851), used when the capability is advertised.
#[must_use]
pub fn move_to(sequence: &str, mailbox: &str) -> String {
    format!("MOVE {sequence} {}", quote_string(mailbox))
}
