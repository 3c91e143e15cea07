//! Error types for imap-engine
//!
//! Four kinds of failure, each carrying the context that triggered it:
//! protocol (tagged NO/BAD, missing capabilities, SASL diagnostics),
//! network (transport-level), parse (unintelligible server data), and
//! timeout (per-command deadline expiry).

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The server answered a command with NO or BAD, refused an
    /// authentication exchange, or lacks a required capability.
    #[error("IMAP protocol error: {message}")]
    Protocol {
        message: String,
        /// The server text that triggered the error, verbatim.
        server_response: String,
        /// The command that was being executed, if any.
        command: Option<String>,
    },

    /// The transport failed: connect, TLS handshake, read, write, or
    /// the peer closed the connection.
    #[error("network error: {message} ({host}:{port})")]
    Network {
        message: String,
        host: String,
        port: u16,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Server data that could not be parsed. `raw` preserves the
    /// offending bytes for logging and diagnosis.
    #[error("parse error: {message}")]
    Parse { message: String, raw: String },

    /// A per-command deadline expired before the tagged response
    /// arrived.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
}

impl Error {
    /// Protocol error from a server response, without command context.
    pub(crate) fn protocol(message: impl Into<String>, server_response: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            server_response: server_response.into(),
            command: None,
        }
    }

    /// Parse error preserving the raw input.
    pub(crate) fn parse(message: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            raw: raw.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
