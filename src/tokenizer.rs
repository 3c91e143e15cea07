//! Response-line tokenizer
//!
//! Lexes one CRLF-stripped response line into a flat token sequence:
//! atoms, quoted strings, literal markers, parenthesized lists, and
//! NIL. Literal octets are never read here; the engine collects them
//! and the parser pairs them with the `Literal` markers afterwards.
//!
//! The grammar is deliberately forgiving: an unterminated quoted
//! string yields its accumulated content, an unterminated list yields
//! the items gathered so far, and a stray `)` at top level ends
//! tokenization. Malformed server data must never take the session
//! down.

/// One lexical token from a response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Bare word, including flags like `\Seen` and bracketed units
    /// like `[UIDVALIDITY 123]` or `BODY[HEADER]`.
    Atom(String),
    /// Contents of a `"..."` string, escapes resolved.
    Quoted(String),
    /// A `{n}` marker; the octets travel out of band.
    Literal(usize),
    /// A `( ... )` group.
    List(Vec<Token>),
    /// The NIL keyword, any case.
    Nil,
}

impl Token {
    /// Text content of an atom or quoted token.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Atom(s) | Self::Quoted(s) => Some(s),
            _ => None,
        }
    }

    /// Parse an atom as a decimal number.
    #[must_use]
    pub fn number(&self) -> Option<u64> {
        match self {
            Self::Atom(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Bytes that terminate an atom. Backslash is deliberately absent:
/// `\Seen` is a single atom.
fn is_atom_special(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')' | b'{' | b' ' | b'\t' | b'"' | b'[' | b']' | b'\r' | b'\n'
    )
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }
}

/// Tokenize a response line.
///
/// Returns the tokens and the unconsumed remainder (non-empty only
/// when a stray `)` or a CR/LF stopped the scan early).
#[must_use]
pub fn tokenize(input: &str) -> (Vec<Token>, &str) {
    let mut cur = Cursor {
        bytes: input.as_bytes(),
        pos: 0,
    };
    let tokens = read_tokens(&mut cur, true);
    (tokens, &input[cur.pos.min(input.len())..])
}

fn read_tokens(cur: &mut Cursor<'_>, top_level: bool) -> Vec<Token> {
    let mut tokens = Vec::new();
    loop {
        match cur.peek() {
            None => break,
            Some(b' ' | b'\t') => {
                cur.pos += 1;
            }
            Some(b'\r' | b'\n') => break,
            Some(b'(') => {
                cur.pos += 1;
                tokens.push(Token::List(read_tokens(cur, false)));
            }
            Some(b')') => {
                if top_level {
                    // Stray close: treat as end of usable input.
                    break;
                }
                cur.pos += 1;
                return tokens;
            }
            Some(b'"') => {
                cur.pos += 1;
                tokens.push(Token::Quoted(read_quoted(cur)));
            }
            Some(b'{') => match read_literal(cur) {
                Some(size) => tokens.push(Token::Literal(size)),
                None => {
                    cur.pos += 1;
                    tokens.push(read_atom(cur, vec![b'{']));
                }
            },
            Some(b'[') => {
                tokens.push(read_atom(cur, Vec::new()));
            }
            Some(b']') => {
                // Dangling close bracket outside any atom; skip it.
                cur.pos += 1;
            }
            Some(_) => {
                tokens.push(read_atom(cur, Vec::new()));
            }
        }
    }
    tokens
}

/// Quoted string body; the opening quote is already consumed. `\`
/// escapes the next byte verbatim. Unterminated input yields whatever
/// accumulated.
fn read_quoted(cur: &mut Cursor<'_>) -> String {
    let mut out = Vec::new();
    loop {
        match cur.bump() {
            None | Some(b'"') => break,
            Some(b'\\') => {
                if let Some(escaped) = cur.bump() {
                    out.push(escaped);
                }
            }
            Some(b) => out.push(b),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `{digits}` at the cursor, or `None` without consuming anything.
fn read_literal(cur: &mut Cursor<'_>) -> Option<usize> {
    let start = cur.pos;
    cur.pos += 1; // '{'
    let digits_start = cur.pos;
    while cur.peek().is_some_and(|b| b.is_ascii_digit()) {
        cur.pos += 1;
    }
    if cur.pos > digits_start && cur.peek() == Some(b'}') {
        let size = std::str::from_utf8(&cur.bytes[digits_start..cur.pos])
            .ok()
            .and_then(|s| s.parse().ok());
        if let Some(size) = size {
            cur.pos += 1; // '}'
            return Some(size);
        }
    }
    cur.pos = start;
    None
}

/// Atom starting at the cursor. A `[` inside or at the start of an
/// atom captures through the matching `]` into the same atom, which
/// keeps `BODY[HEADER]` and `[UIDVALIDITY 123]` intact for the parser.
fn read_atom(cur: &mut Cursor<'_>, mut out: Vec<u8>) -> Token {
    loop {
        match cur.peek() {
            Some(b'[') => {
                out.push(b'[');
                cur.pos += 1;
                loop {
                    match cur.bump() {
                        None => break,
                        Some(b']') => {
                            out.push(b']');
                            break;
                        }
                        Some(b) => out.push(b),
                    }
                }
            }
            Some(b) if !is_atom_special(b) => {
                out.push(b);
                cur.pos += 1;
            }
            _ => break,
        }
    }
    let text = String::from_utf8_lossy(&out).into_owned();
    if text.eq_ignore_ascii_case("NIL") {
        Token::Nil
    } else {
        Token::Atom(text)
    }
}
