//! IMAP connection configuration

use crate::error::{Error, Result};
use std::env;
use std::time::Duration;

/// How the session authenticates after the greeting.
#[derive(Debug, Clone)]
pub enum Auth {
    /// `LOGIN user password`.
    Password(String),
    /// `AUTHENTICATE XOAUTH2` with an opaque OAuth2 access token.
    /// Token acquisition is the caller's problem.
    XOAuth2 { user: String, access_token: String },
}

/// TLS knobs passed through to the transport.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Skip certificate verification. Needed for bridge daemons with
    /// self-signed certificates; never enable against the open internet.
    pub danger_accept_invalid_certs: bool,
}

/// IMAP session configuration.
///
/// `host` and `user` are required; everything else has a sane default
/// (IMAPS port 993, TLS on, 30 second connect and auth deadlines).
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: Auth,
    pub tls: bool,
    pub tls_options: TlsOptions,
    /// Deadline covering greeting plus authentication.
    pub auth_timeout: Duration,
    /// Deadline for the TCP connect.
    pub conn_timeout: Duration,
    /// Default per-command deadline.
    pub command_timeout: Duration,
}

impl ImapConfig {
    /// Password-authenticated configuration with defaults.
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 993,
            user: user.into(),
            auth: Auth::Password(password.into()),
            tls: true,
            tls_options: TlsOptions::default(),
            auth_timeout: Duration::from_secs(30),
            conn_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
        }
    }

    /// XOAUTH2-authenticated configuration with defaults.
    pub fn with_xoauth2(
        host: impl Into<String>,
        user: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        let user = user.into();
        Self {
            host: host.into(),
            port: 993,
            auth: Auth::XOAuth2 {
                user: user.clone(),
                access_token: access_token.into(),
            },
            user,
            tls: true,
            tls_options: TlsOptions::default(),
            auth_timeout: Duration::from_secs(30),
            conn_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
        }
    }

    /// Load IMAP configuration from environment variables
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `IMAP_USERNAME`
    /// - `IMAP_PASSWORD`
    ///
    /// Optional (with defaults):
    /// - `IMAP_HOST` (default: `127.0.0.1`)
    /// - `IMAP_PORT` (default: `993`)
    /// - `IMAP_TLS` (default: `true`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let host = env::var("IMAP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("IMAP_PORT")
            .unwrap_or_else(|_| "993".to_string())
            .parse()
            .map_err(|e| Error::parse(format!("Invalid IMAP_PORT: {e}"), "IMAP_PORT"))?;
        let user = env::var("IMAP_USERNAME").map_err(|_| Error::Protocol {
            message: "IMAP_USERNAME not set".to_string(),
            server_response: String::new(),
            command: None,
        })?;
        let password = env::var("IMAP_PASSWORD").map_err(|_| Error::Protocol {
            message: "IMAP_PASSWORD not set".to_string(),
            server_response: String::new(),
            command: None,
        })?;
        let tls = env::var("IMAP_TLS")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        let mut config = Self::new(host, user, password);
        config.port = port;
        config.tls = tls;
        Ok(config)
    }
}
