//! Protocol engine
//!
//! Owns the transport: allocates tags, frames outgoing commands,
//! demultiplexes the inbound byte stream into logical lines (with
//! literal payloads reassembled), correlates tagged responses to
//! pending commands, enforces per-command deadlines, and broadcasts
//! unsolicited untagged responses.
//!
//! The engine is a cheap-to-clone handle; a background task owns the
//! read half and is aborted when the last handle drops.

use crate::error::{Error, Result};
use crate::mime;
use crate::parser::{self, LineKind, ResponseLine, Status, UntaggedResponse};
use crate::transport::BoxedStream;
use memchr::memchr;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lock that shrugs off poisoning; the protected state stays usable.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Reassembles raw bytes into logical lines.
///
/// A line whose text ends with a `{n}` marker is held open until `n`
/// octets arrive; the octets are stored out of band and the text
/// (marker included) continues accumulating until a CRLF outside any
/// literal.
pub(crate) struct LineDecoder {
    buf: Vec<u8>,
    current: Option<PartialLine>,
}

struct PartialLine {
    text: String,
    literals: Vec<Vec<u8>>,
    remaining: usize,
    literal_buf: Vec<u8>,
}

impl LineDecoder {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::new(),
            current: None,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<ResponseLine> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            // Fill a pending literal first.
            if let Some(partial) = &mut self.current
                && partial.remaining > 0
            {
                let take = partial.remaining.min(self.buf.len());
                if take == 0 {
                    break;
                }
                partial.literal_buf.extend(self.buf.drain(..take));
                partial.remaining -= take;
                if partial.remaining > 0 {
                    break;
                }
                let literal = std::mem::take(&mut partial.literal_buf);
                partial.literals.push(literal);
                continue;
            }

            let Some(newline) = memchr(b'\n', &self.buf) else {
                break;
            };
            let mut segment: Vec<u8> = self.buf.drain(..=newline).collect();
            segment.pop();
            if segment.last() == Some(&b'\r') {
                segment.pop();
            }
            let segment = String::from_utf8_lossy(&segment).into_owned();

            let (mut text, mut literals) = match self.current.take() {
                Some(partial) => (partial.text, partial.literals),
                None => (String::new(), Vec::new()),
            };
            text.push_str(&segment);

            if let Some(size) = trailing_literal_size(&text) {
                if size == 0 {
                    literals.push(Vec::new());
                }
                self.current = Some(PartialLine {
                    text,
                    literals,
                    remaining: size,
                    literal_buf: Vec::new(),
                });
                continue;
            }
            out.push(ResponseLine::with_literals(text, literals));
        }
        out
    }
}

/// Size of a trailing `{n}` marker, if the line ends with one.
fn trailing_literal_size(text: &str) -> Option<usize> {
    let inner = text.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    let digits = &inner[open + 1..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// The tagged completion of one command, with the untagged responses
/// accumulated while it was pending.
#[derive(Debug)]
pub struct CommandOutcome {
    pub tag: String,
    /// Tagged OK text, `[CODE]` prefix preserved.
    pub text: String,
    pub untagged: Vec<UntaggedResponse>,
}

type PendingReply = Result<CommandOutcome>;

struct PendingSlot {
    sender: oneshot::Sender<PendingReply>,
    untagged: Vec<UntaggedResponse>,
    command: String,
}

struct Shared {
    pending: StdMutex<HashMap<String, PendingSlot>>,
    continuation: StdMutex<Option<oneshot::Sender<String>>>,
    unsolicited: broadcast::Sender<UntaggedResponse>,
    closed: AtomicBool,
    host: String,
    port: u16,
}

impl Shared {
    fn closed_error(&self, message: impl Into<String>) -> Error {
        Error::Network {
            message: message.into(),
            host: self.host.clone(),
            port: self.port,
            source: None,
        }
    }

    /// Reject every pending command and poison the engine. Used on
    /// transport error or close.
    fn fail_all(&self, message: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let slots: Vec<PendingSlot> = lock(&self.pending).drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let _ = slot.sender.send(Err(self.closed_error(message)));
        }
        *lock(&self.continuation) = None;
    }
}

/// Engine construction knobs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Tag prefix; tags are `<prefix><NNN>`.
    pub tag_prefix: String,
    pub default_timeout: Duration,
    /// Peer identity carried into network errors.
    pub host: String,
    pub port: u16,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tag_prefix: "A".to_string(),
            default_timeout: Duration::from_secs(30),
            host: String::new(),
            port: 0,
        }
    }
}

struct ReaderGuard(JoinHandle<()>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Cloneable handle to the protocol engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
    writer: Arc<tokio::sync::Mutex<WriteHalf<BoxedStream>>>,
    tag_counter: Arc<AtomicU32>,
    options: Arc<EngineOptions>,
    _reader: Arc<ReaderGuard>,
}

/// An IDLE session entered on the wire; hand it back to
/// [`Engine::finish_idle`] to leave.
pub struct IdleHandle {
    pub(crate) tag: String,
    done: oneshot::Receiver<PendingReply>,
}

impl Engine {
    /// Start an engine over an established stream. Also returns the
    /// initial unsolicited-response subscription, created before the
    /// reader task starts so the greeting cannot be missed.
    #[must_use]
    pub fn new(
        stream: BoxedStream,
        options: EngineOptions,
    ) -> (Self, broadcast::Receiver<UntaggedResponse>) {
        let (unsolicited, startup_rx) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            pending: StdMutex::new(HashMap::new()),
            continuation: StdMutex::new(None),
            unsolicited,
            closed: AtomicBool::new(false),
            host: options.host.clone(),
            port: options.port,
        });
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = tokio::spawn(read_loop(read_half, shared.clone()));
        let engine = Self {
            shared,
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            tag_counter: Arc::new(AtomicU32::new(0)),
            options: Arc::new(options),
            _reader: Arc::new(ReaderGuard(reader)),
        };
        (engine, startup_rx)
    }

    /// Subscribe to unsolicited untagged responses.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<UntaggedResponse> {
        self.shared.unsolicited.subscribe()
    }

    /// Whether the transport has failed or closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn next_tag(&self) -> String {
        let n = self.tag_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}{n:03}", self.options.tag_prefix)
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let map_err = |e: std::io::Error| {
            let message = format!("write failed: {e}");
            Error::Network {
                message,
                host: self.options.host.clone(),
                port: self.options.port,
                source: Some(e),
            }
        };
        writer.write_all(bytes).await.map_err(map_err)?;
        writer.flush().await.map_err(map_err)
    }

    /// Allocate a tag, register the pending slot, transmit the line.
    async fn dispatch(&self, command: &str) -> Result<(String, oneshot::Receiver<PendingReply>)> {
        if self.is_closed() {
            return Err(self.shared.closed_error("connection closed"));
        }
        let tag = self.next_tag();
        let (sender, receiver) = oneshot::channel();
        lock(&self.shared.pending).insert(
            tag.clone(),
            PendingSlot {
                sender,
                untagged: Vec::new(),
                command: command.to_string(),
            },
        );
        debug!("C: {tag} {command}");
        let line = format!("{tag} {command}\r\n");
        if let Err(e) = self.write_all(line.as_bytes()).await {
            lock(&self.shared.pending).remove(&tag);
            return Err(e);
        }
        Ok((tag, receiver))
    }

    async fn finish(
        &self,
        command: &str,
        tag: &str,
        receiver: oneshot::Receiver<PendingReply>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome> {
        let limit = timeout.unwrap_or(self.options.default_timeout);
        match tokio::time::timeout(limit, receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(self.shared.closed_error("connection closed")),
            Err(_) => {
                // Deadline expired: drop the slot so a late tagged
                // response is logged as an unknown tag, not delivered.
                lock(&self.shared.pending).remove(tag);
                Err(Error::Timeout {
                    operation: first_word(command).to_string(),
                    timeout: limit,
                })
            }
        }
    }

    /// Execute one command and await its tagged completion.
    pub async fn execute(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutcome> {
        let (tag, receiver) = self.dispatch(command).await?;
        self.finish(command, &tag, receiver, timeout).await
    }

    /// Execute a command carrying a literal argument: transmit
    /// `<tag> <command> {N}`, await the continuation, send the octets,
    /// then await the tagged completion.
    pub async fn execute_with_literal(
        &self,
        command: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome> {
        let limit = timeout.unwrap_or(self.options.default_timeout);
        let (cont_tx, cont_rx) = oneshot::channel();
        *lock(&self.shared.continuation) = Some(cont_tx);

        let framed = format!("{command} {{{}}}", payload.len());
        let (tag, receiver) = match self.dispatch(&framed).await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                *lock(&self.shared.continuation) = None;
                return Err(e);
            }
        };

        match tokio::time::timeout(limit, cont_rx).await {
            Ok(Ok(_prompt)) => {}
            Ok(Err(_)) => {
                lock(&self.shared.pending).remove(&tag);
                return Err(self.shared.closed_error("connection closed"));
            }
            Err(_) => {
                lock(&self.shared.pending).remove(&tag);
                *lock(&self.shared.continuation) = None;
                return Err(Error::Timeout {
                    operation: first_word(command).to_string(),
                    timeout: limit,
                });
            }
        }

        let mut bytes = payload.to_vec();
        bytes.extend_from_slice(b"\r\n");
        if let Err(e) = self.write_all(&bytes).await {
            lock(&self.shared.pending).remove(&tag);
            return Err(e);
        }
        self.finish(command, &tag, receiver, timeout).await
    }

    /// Execute a single-line SASL exchange (XOAUTH2). A continuation
    /// from the server carries a base64 error diagnostic; the client
    /// must answer it with a blank line and surface the decoded text
    /// in the resulting error.
    pub async fn execute_sasl(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome> {
        let limit = timeout.unwrap_or(self.options.default_timeout);
        let deadline = tokio::time::Instant::now() + limit;

        let (cont_tx, cont_rx) = oneshot::channel();
        *lock(&self.shared.continuation) = Some(cont_tx);
        let (tag, mut receiver) = match self.dispatch(command).await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                *lock(&self.shared.continuation) = None;
                return Err(e);
            }
        };

        let mut cont_rx = cont_rx;
        // Parked senders keep replaced receivers pending instead of
        // completing with an error and spinning the select loop.
        let mut parked: Vec<oneshot::Sender<String>> = Vec::new();
        let mut diagnostics: Vec<String> = Vec::new();
        loop {
            tokio::select! {
                reply = &mut receiver => {
                    *lock(&self.shared.continuation) = None;
                    return match reply {
                        Ok(Ok(outcome)) => Ok(outcome),
                        Ok(Err(err)) => Err(attach_diagnostics(err, &diagnostics)),
                        Err(_) => Err(self.shared.closed_error("connection closed")),
                    };
                }
                cont = &mut cont_rx => {
                    match cont {
                        Ok(prompt) => {
                            let prompt = prompt.trim();
                            if !prompt.is_empty() {
                                let decoded = mime::decode_base64(prompt.as_bytes())
                                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                                    .unwrap_or_else(|_| prompt.to_string());
                                diagnostics.push(decoded);
                            }
                            self.write_all(b"\r\n").await?;
                            let (next_tx, next_rx) = oneshot::channel();
                            *lock(&self.shared.continuation) = Some(next_tx);
                            cont_rx = next_rx;
                        }
                        Err(_) => {
                            let (next_tx, next_rx) = oneshot::channel();
                            parked.push(next_tx);
                            cont_rx = next_rx;
                        }
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    lock(&self.shared.pending).remove(&tag);
                    *lock(&self.shared.continuation) = None;
                    return Err(Error::Timeout {
                        operation: first_word(command).to_string(),
                        timeout: limit,
                    });
                }
            }
        }
    }

    /// Send `IDLE` and wait for the continuation that opens the idle
    /// state. The returned handle completes the command on
    /// [`Engine::finish_idle`].
    pub async fn enter_idle(&self, timeout: Option<Duration>) -> Result<IdleHandle> {
        let limit = timeout.unwrap_or(self.options.default_timeout);
        let (cont_tx, cont_rx) = oneshot::channel();
        *lock(&self.shared.continuation) = Some(cont_tx);
        let (tag, mut receiver) = match self.dispatch("IDLE").await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                *lock(&self.shared.continuation) = None;
                return Err(e);
            }
        };

        tokio::select! {
            cont = cont_rx => match cont {
                Ok(_) => Ok(IdleHandle { tag, done: receiver }),
                Err(_) => {
                    lock(&self.shared.pending).remove(&tag);
                    Err(self.shared.closed_error("connection closed"))
                }
            },
            reply = &mut receiver => {
                *lock(&self.shared.continuation) = None;
                match reply {
                    Ok(Ok(outcome)) => Err(Error::protocol(
                        "server completed IDLE without a continuation",
                        outcome.text,
                    )),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(self.shared.closed_error("connection closed")),
                }
            }
            () = tokio::time::sleep(limit) => {
                lock(&self.shared.pending).remove(&tag);
                *lock(&self.shared.continuation) = None;
                Err(Error::Timeout { operation: "IDLE".to_string(), timeout: limit })
            }
        }
    }

    /// Send `DONE` and await the tagged completion of the IDLE
    /// command. A no-op when the transport already closed.
    pub async fn finish_idle(
        &self,
        handle: IdleHandle,
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome> {
        if self.is_closed() {
            return Ok(CommandOutcome {
                tag: handle.tag,
                text: String::new(),
                untagged: Vec::new(),
            });
        }
        self.write_all(b"DONE\r\n").await?;
        self.finish("IDLE", &handle.tag, handle.done, timeout).await
    }
}

fn first_word(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or(command)
}

fn attach_diagnostics(err: Error, diagnostics: &[String]) -> Error {
    if diagnostics.is_empty() {
        return err;
    }
    match err {
        Error::Protocol {
            message,
            server_response,
            command,
        } => Error::Protocol {
            message: format!("{message} ({})", diagnostics.join("; ")),
            server_response,
            command,
        },
        other => other,
    }
}

async fn read_loop(mut reader: ReadHalf<BoxedStream>, shared: Arc<Shared>) {
    let mut decoder = LineDecoder::new();
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("transport closed by peer");
                shared.fail_all("connection closed");
                break;
            }
            Ok(n) => {
                for line in decoder.push(&buf[..n]) {
                    process_line(&shared, &line);
                }
            }
            Err(e) => {
                debug!("transport read error: {e}");
                shared.fail_all(&format!("read failed: {e}"));
                break;
            }
        }
    }
}

fn process_line(shared: &Shared, line: &ResponseLine) {
    debug!("S: {}", line.text);
    match parser::classify_line(&line.text) {
        LineKind::Continuation => {
            let prompt = line
                .text
                .strip_prefix('+')
                .unwrap_or("")
                .trim_start()
                .to_string();
            match lock(&shared.continuation).take() {
                Some(listener) => {
                    let _ = listener.send(prompt);
                }
                None => debug!("continuation with no listener, discarded"),
            }
        }
        LineKind::Untagged => match parser::parse_untagged(line) {
            Ok(response) => {
                {
                    let mut pending = lock(&shared.pending);
                    for slot in pending.values_mut() {
                        slot.untagged.push(response.clone());
                    }
                }
                let _ = shared.unsolicited.send(response);
            }
            Err(e) => warn!("unparseable untagged response: {e}"),
        },
        LineKind::Tagged => {
            let tagged = parser::parse_tagged(&line.text);
            let slot = lock(&shared.pending).remove(&tagged.tag);
            match slot {
                None => debug!("response for unknown tag {}, ignored", tagged.tag),
                Some(slot) => {
                    let reply = match tagged.status {
                        Status::Ok => Ok(CommandOutcome {
                            tag: tagged.tag,
                            text: tagged.text,
                            untagged: slot.untagged,
                        }),
                        Status::No | Status::Bad => Err(Error::Protocol {
                            message: tagged.text,
                            server_response: line.text.clone(),
                            command: Some(slot.command),
                        }),
                    };
                    let _ = slot.sender.send(reply);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn decoder_lines(chunks: &[&[u8]]) -> Vec<ResponseLine> {
        let mut decoder = LineDecoder::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(decoder.push(chunk));
        }
        out
    }

    #[test]
    fn decoder_plain_lines() {
        let lines = decoder_lines(&[b"* OK ready\r\nA001 OK done\r\n"]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "* OK ready");
        assert_eq!(lines[1].text, "A001 OK done");
    }

    #[test]
    fn decoder_split_across_reads() {
        let lines = decoder_lines(&[b"* OK re", b"ady\r", b"\n"]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "* OK ready");
    }

    #[test]
    fn decoder_literal_reassembly() {
        let lines = decoder_lines(&[
            b"* 1 FETCH (UID 1 BODY[TEXT] {11}\r\nHello\r\nWorld)\r\n",
        ]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "* 1 FETCH (UID 1 BODY[TEXT] {11})");
        assert_eq!(lines[0].literals, vec![b"Hello\r\nWorld".to_vec()]);
    }

    #[test]
    fn decoder_literal_split_across_reads() {
        let lines = decoder_lines(&[
            b"* 1 FETCH (BODY[TEXT] {11}\r\nHel",
            b"lo\r\nWo",
            b"rld)\r\n",
        ]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].literals, vec![b"Hello\r\nWorld".to_vec()]);
    }

    #[test]
    fn decoder_multiple_literals_one_line() {
        let lines = decoder_lines(&[
            b"* 1 FETCH (BODY[HEADER] {3}\r\nabc BODY[TEXT] {2}\r\nxy)\r\n",
        ]);
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0].text,
            "* 1 FETCH (BODY[HEADER] {3} BODY[TEXT] {2})"
        );
        assert_eq!(lines[0].literals, vec![b"abc".to_vec(), b"xy".to_vec()]);
    }

    #[test]
    fn decoder_zero_length_literal() {
        let lines = decoder_lines(&[b"* 1 FETCH (BODY[TEXT] {0}\r\n)\r\n"]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].literals, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn trailing_marker_detection() {
        assert_eq!(trailing_literal_size("FETCH {14}"), Some(14));
        assert_eq!(trailing_literal_size("FETCH {0}"), Some(0));
        assert_eq!(trailing_literal_size("FETCH {x}"), None);
        assert_eq!(trailing_literal_size("FETCH 14}"), None);
        assert_eq!(trailing_literal_size("no marker"), None);
    }

    // -- engine tests over an in-memory duplex --

    fn test_engine(server_buffer: usize) -> (Engine, broadcast::Receiver<UntaggedResponse>, DuplexStream) {
        let (client, server) = tokio::io::duplex(server_buffer);
        let options = EngineOptions {
            host: "test".to_string(),
            port: 143,
            default_timeout: Duration::from_secs(5),
            ..EngineOptions::default()
        };
        let (engine, startup) = Engine::new(Box::new(client), options);
        (engine, startup, server)
    }

    async fn read_line(server: &mut DuplexStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = server.read(&mut byte).await.unwrap();
            if n == 0 || byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line).unwrap()
    }

    #[tokio::test]
    async fn tags_are_sequential_and_padded() {
        let (engine, _rx, mut server) = test_engine(4096);
        let task = tokio::spawn(async move {
            let first = read_line(&mut server).await;
            assert_eq!(first, "A001 NOOP");
            server.write_all(b"A001 OK NOOP completed\r\n").await.unwrap();
            let second = read_line(&mut server).await;
            assert_eq!(second, "A002 NOOP");
            server.write_all(b"A002 OK NOOP completed\r\n").await.unwrap();
        });
        engine.execute("NOOP", None).await.unwrap();
        engine.execute("NOOP", None).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn untagged_accumulates_into_outcome() {
        let (engine, _rx, mut server) = test_engine(4096);
        let task = tokio::spawn(async move {
            let _ = read_line(&mut server).await;
            server
                .write_all(b"* SEARCH 2 84 882\r\nA001 OK UID SEARCH completed\r\n")
                .await
                .unwrap();
        });
        let outcome = engine.execute("UID SEARCH ALL", None).await.unwrap();
        assert_eq!(outcome.untagged.len(), 1);
        assert_eq!(outcome.untagged[0].kind, "SEARCH");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn no_response_rejects_with_protocol_error() {
        let (engine, _rx, mut server) = test_engine(4096);
        let task = tokio::spawn(async move {
            let _ = read_line(&mut server).await;
            server
                .write_all(b"A001 NO [NONEXISTENT] Unknown mailbox\r\n")
                .await
                .unwrap();
        });
        let err = engine.execute("SELECT Nope", None).await.unwrap_err();
        match err {
            Error::Protocol {
                message, command, ..
            } => {
                assert!(message.contains("Unknown mailbox"));
                assert_eq!(command.as_deref(), Some("SELECT Nope"));
            }
            other => panic!("unexpected {other:?}"),
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_leaves_pipeline_usable() {
        let (engine, _rx, mut server) = test_engine(4096);
        let task = tokio::spawn(async move {
            // Swallow the FETCH, answer nothing, then serve the NOOP.
            let fetch = read_line(&mut server).await;
            assert!(fetch.starts_with("A001 "));
            let noop = read_line(&mut server).await;
            assert_eq!(noop, "A002 NOOP");
            // Late response for the dead tag must be ignored.
            server
                .write_all(b"A001 OK too late\r\nA002 OK NOOP completed\r\n")
                .await
                .unwrap();
        });

        let err = engine
            .execute("UID FETCH 1 (UID FLAGS)", Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        let outcome = engine.execute("NOOP", None).await.unwrap();
        assert_eq!(outcome.tag, "A002");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn literal_command_waits_for_continuation() {
        let (engine, _rx, mut server) = test_engine(4096);
        let task = tokio::spawn(async move {
            let line = read_line(&mut server).await;
            assert_eq!(line, "A001 LOGIN user {6}");
            server.write_all(b"+ Ready for literal\r\n").await.unwrap();
            let mut payload = [0u8; 8];
            server.read_exact(&mut payload).await.unwrap();
            assert_eq!(&payload, b"s3cr3t\r\n");
            server.write_all(b"A001 OK LOGIN completed\r\n").await.unwrap();
        });
        engine
            .execute_with_literal("LOGIN user", b"s3cr3t", None)
            .await
            .unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn sasl_continuation_diagnostic_is_surfaced() {
        let (engine, _rx, mut server) = test_engine(4096);
        let task = tokio::spawn(async move {
            let line = read_line(&mut server).await;
            assert!(line.starts_with("A001 AUTHENTICATE XOAUTH2 "));
            server
                .write_all(b"+ eyJzdGF0dXMiOiI0MDAifQ==\r\n")
                .await
                .unwrap();
            // The client must answer the challenge with a blank line.
            let blank = read_line(&mut server).await;
            assert_eq!(blank, "");
            server
                .write_all(b"A001 NO SASL authentication failed\r\n")
                .await
                .unwrap();
        });
        let err = engine
            .execute_sasl("AUTHENTICATE XOAUTH2 dXNlcj11AWF1dGg9QmVhcmVyIHQBAQ==", None)
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("SASL authentication failed"), "{text}");
        assert!(text.contains("{\"status\":\"400\"}"), "{text}");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn idle_enter_and_done() {
        let (engine, _rx, mut server) = test_engine(4096);
        let task = tokio::spawn(async move {
            let line = read_line(&mut server).await;
            assert_eq!(line, "A001 IDLE");
            server.write_all(b"+ idling\r\n").await.unwrap();
            server.write_all(b"* 173 EXISTS\r\n").await.unwrap();
            let done = read_line(&mut server).await;
            assert_eq!(done, "DONE");
            server.write_all(b"A001 OK IDLE terminated\r\n").await.unwrap();
        });

        let mut events = engine.subscribe();
        let handle = engine.enter_idle(None).await.unwrap();
        let exists = events.recv().await.unwrap();
        assert_eq!(exists.kind, "EXISTS");
        let outcome = engine.finish_idle(handle, None).await.unwrap();
        assert_eq!(outcome.untagged.len(), 1);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn close_rejects_pending_and_future_commands() {
        let (engine, _rx, server) = test_engine(4096);
        let pending = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("NOOP", None).await })
        };
        // Give the command a moment to hit the wire, then close.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(server);
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Network { .. }));

        let err = engine.execute("NOOP", None).await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
    }

    #[tokio::test]
    async fn unsolicited_continuation_is_discarded() {
        let (engine, _rx, mut server) = test_engine(4096);
        let task = tokio::spawn(async move {
            let _ = read_line(&mut server).await;
            // Stray continuation, then the real completion.
            server
                .write_all(b"+ go ahead\r\nA001 OK NOOP completed\r\n")
                .await
                .unwrap();
        });
        engine.execute("NOOP", None).await.unwrap();
        task.await.unwrap();
    }
}
