//! TCP/TLS transport
//!
//! Opens the ordered byte-stream duplex channel the engine runs on.
//! TLS is negotiated here at connect time (IMAPS); with `tls = false`
//! the raw TCP stream is returned, which the test suite uses. There
//! is no plaintext-upgrade path.

use crate::config::ImapConfig;
use crate::error::{Error, Result};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// The byte stream an engine runs on.
pub trait ImapStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ImapStream for T {}

/// Owned, type-erased stream.
pub type BoxedStream = Box<dyn ImapStream>;

fn network_error(
    message: impl Into<String>,
    config: &ImapConfig,
    source: Option<std::io::Error>,
) -> Error {
    Error::Network {
        message: message.into(),
        host: config.host.clone(),
        port: config.port,
        source,
    }
}

/// Open a fresh transport stream per the configuration.
///
/// Connects to `config.host:config.port` via TCP within
/// `conn_timeout`, then performs the TLS handshake when TLS is
/// enabled.
pub async fn connect(config: &ImapConfig) -> Result<BoxedStream> {
    let addr = format!("{}:{}", config.host, config.port);
    debug!("Connecting to IMAP server at {}", addr);

    let tcp_stream = tokio::time::timeout(config.conn_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::Timeout {
            operation: "connect".to_string(),
            timeout: config.conn_timeout,
        })?
        .map_err(|e| network_error(format!("TCP connect failed: {e}"), config, Some(e)))?;

    if !config.tls {
        return Ok(Box::new(tcp_stream));
    }

    // Ensure the ring crypto provider is installed process-wide.
    // Multiple sessions may race to install it, so the error is
    // ignored if it's already set.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let connector = tls_connector(config)?;
    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|e| network_error(format!("Invalid server name: {e}"), config, None))?;

    let tls_stream = connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| network_error(format!("TLS handshake failed: {e}"), config, Some(e)))?;

    debug!("TLS established with {}", addr);
    Ok(Box::new(tls_stream))
}

fn tls_connector(config: &ImapConfig) -> Result<TlsConnector> {
    let tls_config = if config.tls_options.danger_accept_invalid_certs {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DangerousVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            roots.add(cert).ok();
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Certificate verifier that accepts all certificates (for bridge
/// daemons with self-signed certs).
#[derive(Debug)]
struct DangerousVerifier;

impl rustls::client::danger::ServerCertVerifier for DangerousVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
