//! Scripted fake IMAP server for integration testing
//!
//! A plain-TCP server driven by a wire script: for each expected
//! client line (matched by substring) it writes a canned reply
//! verbatim, literals and all. Every received line is recorded so
//! tests can assert on the exact commands the client produced.

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// One scripted request/response pair.
pub struct Exchange {
    /// Substring the received line must contain. Empty matches
    /// anything, including the blank line of a SASL abort.
    pub expect: &'static str,
    /// Bytes written back verbatim. May be empty to stay silent.
    pub reply: &'static str,
}

impl Exchange {
    pub const fn new(expect: &'static str, reply: &'static str) -> Self {
        Self { expect, reply }
    }
}

/// A fake IMAP server on an OS-assigned localhost port.
pub struct ScriptedServer {
    port: u16,
    received: Arc<Mutex<Vec<String>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl ScriptedServer {
    /// Start the server: send `greeting`, then walk the script. After
    /// the script runs out the connection is held open and drained
    /// until the client hangs up.
    pub async fn start(greeting: &'static str, script: Vec<Exchange>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();

        let handle = tokio::spawn(async move {
            let Ok((stream, _addr)) = listener.accept().await else {
                return;
            };
            let mut reader = BufReader::new(stream);

            let hello = format!("{greeting}\r\n");
            if reader.get_mut().write_all(hello.as_bytes()).await.is_err() {
                return;
            }

            for exchange in script {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                log.lock().unwrap().push(trimmed.clone());

                if !trimmed.contains(exchange.expect) {
                    // Script mismatch: answer BAD so the test fails
                    // fast instead of hanging on a missing reply.
                    let tag = trimmed.split(' ').next().unwrap_or("*");
                    let bad = format!("{tag} BAD expected '{}'\r\n", exchange.expect);
                    let _ = reader.get_mut().write_all(bad.as_bytes()).await;
                    continue;
                }
                if !exchange.reply.is_empty()
                    && reader
                        .get_mut()
                        .write_all(exchange.reply.as_bytes())
                        .await
                        .is_err()
                {
                    return;
                }
            }

            // Script exhausted: drain until the client disconnects.
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        log.lock()
                            .unwrap()
                            .push(line.trim_end_matches(['\r', '\n']).to_string());
                    }
                }
            }
        });

        Self {
            port,
            received,
            _handle: handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Every line the client has sent so far.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}
