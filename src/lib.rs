#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Async IMAP4rev1 client protocol engine
//!
//! A from-the-wire-up IMAP client library: tokenizer, response
//! parser, command builder, tag-correlated request pipeline with
//! literal handling, session state machine, IDLE/polling change
//! notification, and an on-demand MIME decoder. Implements RFC 3501
//! with the CONDSTORE/QRESYNC (RFC 7162), IDLE (RFC 2177), and
//! XOAUTH2 extensions.
//!
//! ```no_run
//! use imap_engine::{FetchOptions, ImapConfig, SearchCriterion, Session};
//!
//! # async fn demo() -> imap_engine::Result<()> {
//! let config = ImapConfig::new("imap.example.com", "user@example.com", "password");
//! let mut session = Session::connect(config).await?;
//! session.authenticate().await?;
//! session.open_box("INBOX", false).await?;
//! let messages = session
//!     .search_fetch(&[SearchCriterion::Unseen], &FetchOptions::bodies(&["HEADER"]))
//!     .await?;
//! for message in &messages {
//!     if let Some(headers) = message.part("HEADER") {
//!         println!("{}: {}", message.uid, headers.text());
//!     }
//! }
//! session.logout().await?;
//! # Ok(())
//! # }
//! ```

pub mod command;
mod config;
mod engine;
mod error;
pub mod mime;
pub mod parser;
mod session;
pub mod tokenizer;
mod transport;
mod types;
mod watch;

pub use config::{Auth, ImapConfig, TlsOptions};
pub use engine::{CommandOutcome, Engine, EngineOptions, IdleHandle};
pub use error::{Error, Result};
pub use parser::{
    FetchValue, LineKind, ParsedBatch, ResponseLine, Status, TaggedResponse, UntaggedData,
    UntaggedResponse,
};
pub use session::{Session, SessionState};
pub use tokenizer::Token;
pub use transport::{BoxedStream, ImapStream};
pub use types::{
    Address, BodySection, BodyStructure, Capabilities, Envelope, FetchOptions, Flag, ListEntry,
    Mailbox, Message, MessageCounts, MessagePart, QresyncOpen, QresyncParams, SearchCriterion,
    SearchResult, uid_set,
};
pub use watch::{MailboxWatch, WatchEvent};
