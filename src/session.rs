//! Client facade / session
//!
//! Drives the server through its session state machine
//! (NotAuthenticated -> Authenticated -> Selected), tracks
//! capabilities, builds per-operation commands, and interprets the
//! accumulated untagged responses into the public data model. All
//! message addressing from this facade is in UID space: every
//! SEARCH/FETCH/STORE/COPY/MOVE goes out with the `UID ` prefix.

use crate::command;
use crate::config::{Auth, ImapConfig};
use crate::engine::{CommandOutcome, Engine, EngineOptions};
use crate::error::{Error, Result};
use crate::parser::{self, UntaggedData, UntaggedResponse};
use crate::transport::{self, BoxedStream};
use crate::types::{
    Capabilities, FetchOptions, Flag, ListEntry, Mailbox, Message, QresyncOpen, QresyncParams,
    SearchCriterion, SearchResult, uid_set,
};
use crate::watch::MailboxWatch;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Where the session stands in the RFC 3501 state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotAuthenticated,
    Authenticated,
    Selected,
    LoggingOut,
    Disconnected,
}

/// One IMAP session over one transport connection.
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

pub struct Session {
    engine: Engine,
    config: ImapConfig,
    state: SessionState,
    capabilities: Capabilities,
    selected: Option<Mailbox>,
    watch_active: Arc<AtomicBool>,
}

impl Session {
    /// Connect per the configuration and await the server greeting.
    /// The session comes back NotAuthenticated (or Authenticated on a
    /// PREAUTH greeting); call [`Session::authenticate`] next.
    pub async fn connect(config: ImapConfig) -> Result<Self> {
        let stream = transport::connect(&config).await?;
        Self::connect_with_stream(config, stream).await
    }

    /// Run the session over an externally established stream. Useful
    /// for custom transports and tests.
    pub async fn connect_with_stream(config: ImapConfig, stream: BoxedStream) -> Result<Self> {
        let options = EngineOptions {
            host: config.host.clone(),
            port: config.port,
            default_timeout: config.command_timeout,
            ..EngineOptions::default()
        };
        let (engine, mut startup) = Engine::new(stream, options);
        let mut session = Self {
            engine,
            config,
            state: SessionState::NotAuthenticated,
            capabilities: Capabilities::default(),
            selected: None,
            watch_active: Arc::new(AtomicBool::new(false)),
        };
        session.await_greeting(&mut startup).await?;
        Ok(session)
    }

    async fn await_greeting(
        &mut self,
        startup: &mut broadcast::Receiver<UntaggedResponse>,
    ) -> Result<()> {
        let timeout = self.config.auth_timeout;
        let greeting = match tokio::time::timeout(timeout, startup.recv()).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(Error::Network {
                    message: "connection closed before greeting".to_string(),
                    host: self.config.host.clone(),
                    port: self.config.port,
                    source: None,
                });
            }
            Err(_) => {
                return Err(Error::Timeout {
                    operation: "greeting".to_string(),
                    timeout,
                });
            }
        };

        match greeting.kind.as_str() {
            "OK" => self.state = SessionState::NotAuthenticated,
            "PREAUTH" => self.state = SessionState::Authenticated,
            "BYE" => {
                self.state = SessionState::Disconnected;
                return Err(Error::protocol("server refused the connection", greeting.raw));
            }
            other => {
                return Err(Error::parse(
                    format!("unexpected greeting '{other}'"),
                    greeting.raw,
                ));
            }
        }

        if let UntaggedData::Status {
            code: Some(code), ..
        } = &greeting.data
        {
            self.seed_capabilities(code);
        }
        debug!("greeting received, session {:?}", self.state);
        Ok(())
    }

    /// Take `CAPABILITY ...` words from a response code.
    fn seed_capabilities(&mut self, code: &str) {
        let mut words = code.split_whitespace();
        if words
            .next()
            .is_some_and(|w| w.eq_ignore_ascii_case("CAPABILITY"))
        {
            self.capabilities.replace(words);
            debug!("capabilities seeded from response code");
        }
    }

    /// Authenticate with LOGIN or XOAUTH2 per the configuration, then
    /// refresh the capability set.
    pub async fn authenticate(&mut self) -> Result<()> {
        if self.state != SessionState::NotAuthenticated {
            return Err(Error::protocol(
                "authenticate is only valid in the NotAuthenticated state",
                format!("{:?}", self.state),
            ));
        }
        let timeout = Some(self.config.auth_timeout);
        let outcome = match &self.config.auth {
            Auth::Password(password) => {
                self.engine
                    .execute(&command::login(&self.config.user, password), timeout)
                    .await?
            }
            Auth::XOAuth2 { user, access_token } => {
                self.engine
                    .execute_sasl(&command::xoauth2(user, access_token), timeout)
                    .await?
            }
        };
        self.state = SessionState::Authenticated;
        info!("authenticated as {}", self.config.user);
        self.refresh_capabilities(&outcome).await
    }

    /// Refresh capabilities from a completed command: the `[CAPABILITY
    /// ...]` code on the tagged OK, an untagged CAPABILITY in the
    /// batch, or an explicit CAPABILITY command as a last resort.
    async fn refresh_capabilities(&mut self, outcome: &CommandOutcome) -> Result<()> {
        if let Some(code) = parser::bracket_code(&outcome.text) {
            self.seed_capabilities(code);
        }
        for response in &outcome.untagged {
            if let UntaggedData::Capability(caps) = &response.data {
                self.capabilities.replace(caps.iter());
            }
        }
        if self.capabilities.is_known() {
            return Ok(());
        }
        self.capability().await.map(|_| ())
    }

    /// Issue CAPABILITY and return the refreshed set.
    pub async fn capability(&mut self) -> Result<Vec<String>> {
        self.require_open()?;
        let outcome = self.engine.execute(&command::capability(), None).await?;
        for response in &outcome.untagged {
            if let UntaggedData::Capability(caps) = &response.data {
                self.capabilities.replace(caps.iter());
            }
        }
        Ok(self.capabilities.iter().map(str::to_string).collect())
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.has(name)
    }

    #[must_use]
    pub fn has_condstore(&self) -> bool {
        self.capabilities.has("CONDSTORE")
    }

    #[must_use]
    pub fn has_qresync(&self) -> bool {
        self.capabilities.has("QRESYNC")
    }

    /// The currently selected mailbox, if any.
    #[must_use]
    pub fn selected(&self) -> Option<&Mailbox> {
        self.selected.as_ref()
    }

    // -- state guards: refuse before touching the transport --

    fn require_open(&self) -> Result<()> {
        match self.state {
            SessionState::Disconnected | SessionState::LoggingOut => Err(Error::protocol(
                "session is disconnected",
                format!("{:?}", self.state),
            )),
            _ => Ok(()),
        }
    }

    fn require_authenticated(&self) -> Result<()> {
        match self.state {
            SessionState::Authenticated | SessionState::Selected => Ok(()),
            _ => Err(Error::protocol(
                "operation requires an authenticated session",
                format!("{:?}", self.state),
            )),
        }
    }

    fn require_selected(&self) -> Result<()> {
        if self.state == SessionState::Selected {
            Ok(())
        } else {
            Err(Error::protocol(
                "no mailbox selected",
                format!("{:?}", self.state),
            ))
        }
    }

    // -- mailbox management --

    pub async fn list(&mut self, reference: &str, pattern: &str) -> Result<Vec<ListEntry>> {
        self.require_authenticated()?;
        let outcome = self
            .engine
            .execute(&command::list(reference, pattern), None)
            .await?;
        Ok(parser::parse_list_response(&outcome.untagged))
    }

    pub async fn lsub(&mut self, reference: &str, pattern: &str) -> Result<Vec<ListEntry>> {
        self.require_authenticated()?;
        let outcome = self
            .engine
            .execute(&command::lsub(reference, pattern), None)
            .await?;
        Ok(parser::parse_list_response(&outcome.untagged))
    }

    pub async fn create_box(&mut self, name: &str) -> Result<()> {
        self.require_authenticated()?;
        self.engine.execute(&command::create(name), None).await?;
        Ok(())
    }

    pub async fn delete_box(&mut self, name: &str) -> Result<()> {
        self.require_authenticated()?;
        self.engine.execute(&command::delete(name), None).await?;
        Ok(())
    }

    pub async fn rename_box(&mut self, old: &str, new: &str) -> Result<()> {
        self.require_authenticated()?;
        self.engine.execute(&command::rename(old, new), None).await?;
        Ok(())
    }

    /// SELECT (or EXAMINE, with `read_only`) a mailbox. On success
    /// the previous selection is replaced; on failure no mailbox is
    /// selected.
    pub async fn open_box(&mut self, name: &str, read_only: bool) -> Result<Mailbox> {
        self.require_authenticated()?;
        self.drop_selection();
        let outcome = self
            .engine
            .execute(&command::select(name, read_only), None)
            .await?;
        let mailbox =
            parser::parse_select_response(&outcome.untagged, &outcome.text, name, read_only)?;
        info!(
            "selected {} ({} messages)",
            mailbox.name, mailbox.messages.total
        );
        self.selected = Some(mailbox.clone());
        self.state = SessionState::Selected;
        Ok(mailbox)
    }

    /// QRESYNC-augmented SELECT/EXAMINE (RFC 7162). Fails when the
    /// known capability set lacks QRESYNC.
    pub async fn open_box_with_qresync(
        &mut self,
        name: &str,
        params: &QresyncParams,
        read_only: bool,
    ) -> Result<QresyncOpen> {
        self.require_authenticated()?;
        if self.capabilities.is_known() && !self.has_qresync() {
            return Err(Error::protocol(
                "server does not advertise QRESYNC",
                String::new(),
            ));
        }
        self.drop_selection();
        let outcome = self
            .engine
            .execute(&command::select_qresync(name, read_only, params), None)
            .await?;
        let mailbox =
            parser::parse_select_response(&outcome.untagged, &outcome.text, name, read_only)?;

        let mut vanished = Vec::new();
        let mut vanished_earlier = false;
        for response in &outcome.untagged {
            if let UntaggedData::Vanished { earlier, uids } = &response.data {
                vanished.extend_from_slice(uids);
                vanished_earlier |= earlier;
            }
        }

        self.selected = Some(mailbox.clone());
        self.state = SessionState::Selected;
        Ok(QresyncOpen {
            mailbox,
            vanished,
            vanished_earlier,
        })
    }

    fn drop_selection(&mut self) {
        self.selected = None;
        if self.state == SessionState::Selected {
            self.state = SessionState::Authenticated;
        }
    }

    // -- message operations (UID space) --

    /// `UID SEARCH` with the given criteria; the result is UIDs.
    pub async fn search(&mut self, criteria: &[SearchCriterion]) -> Result<SearchResult> {
        self.search_modseq(criteria, None).await
    }

    /// `UID SEARCH ... (CHANGEDSINCE n)` (CONDSTORE).
    pub async fn search_modseq(
        &mut self,
        criteria: &[SearchCriterion],
        changed_since: Option<u64>,
    ) -> Result<SearchResult> {
        self.require_selected()?;
        let cmd = format!("UID {}", command::search(criteria, changed_since));
        let outcome = self.engine.execute(&cmd, None).await?;
        Ok(parser::parse_search_response(&outcome.untagged))
    }

    /// SEARCH, then FETCH the matches with the given options. An
    /// empty match list returns immediately without fetching.
    pub async fn search_fetch(
        &mut self,
        criteria: &[SearchCriterion],
        options: &FetchOptions,
    ) -> Result<Vec<Message>> {
        let found = self.search(criteria).await?;
        if found.uids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch(&found.uids, options).await
    }

    /// `UID FETCH` an ordered UID list.
    pub async fn fetch(&mut self, uids: &[u32], options: &FetchOptions) -> Result<Vec<Message>> {
        self.require_selected()?;
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_set(&uid_set(uids), options).await
    }

    /// `UID FETCH` a raw sequence-set string.
    pub async fn fetch_set(
        &mut self,
        sequence: &str,
        options: &FetchOptions,
    ) -> Result<Vec<Message>> {
        self.require_selected()?;
        let cmd = format!("UID {}", command::fetch(sequence, options));
        let outcome = self.engine.execute(&cmd, None).await?;
        parser::parse_fetch_response(&outcome.untagged)
    }

    /// `UID STORE +FLAGS`. A no-op when either list is empty.
    pub async fn add_flags(&mut self, uids: &[u32], flags: &[Flag]) -> Result<()> {
        self.store_flags(uids, flags, true).await
    }

    /// `UID STORE -FLAGS`. A no-op when either list is empty.
    pub async fn del_flags(&mut self, uids: &[u32], flags: &[Flag]) -> Result<()> {
        self.store_flags(uids, flags, false).await
    }

    async fn store_flags(&mut self, uids: &[u32], flags: &[Flag], add: bool) -> Result<()> {
        self.require_selected()?;
        if uids.is_empty() || flags.is_empty() {
            return Ok(());
        }
        let cmd = format!("UID {}", command::store(&uid_set(uids), add, flags));
        self.engine.execute(&cmd, None).await?;
        Ok(())
    }

    /// `UID COPY` to another mailbox.
    pub async fn copy(&mut self, uids: &[u32], mailbox: &str) -> Result<()> {
        self.require_selected()?;
        if uids.is_empty() {
            return Ok(());
        }
        let cmd = format!("UID {}", command::copy(&uid_set(uids), mailbox));
        self.engine.execute(&cmd, None).await?;
        Ok(())
    }

    /// Move messages: native `UID MOVE` when the server advertises
    /// MOVE, otherwise COPY plus `+FLAGS (\Deleted)`. The emulation
    /// leaves tombstones until [`Session::expunge`].
    pub async fn move_messages(&mut self, uids: &[u32], mailbox: &str) -> Result<()> {
        self.require_selected()?;
        if uids.is_empty() {
            return Ok(());
        }
        if self.capabilities.has("MOVE") {
            let cmd = format!("UID {}", command::move_to(&uid_set(uids), mailbox));
            self.engine.execute(&cmd, None).await?;
            return Ok(());
        }
        self.copy(uids, mailbox).await?;
        self.add_flags(uids, &[Flag::Deleted]).await
    }

    pub async fn expunge(&mut self) -> Result<()> {
        self.require_selected()?;
        self.engine.execute(&command::expunge(), None).await?;
        Ok(())
    }

    /// NOOP; returns the untagged responses that rode along.
    pub async fn noop(&mut self) -> Result<Vec<UntaggedResponse>> {
        self.require_open()?;
        let outcome = self.engine.execute(&command::noop(), None).await?;
        Ok(outcome.untagged)
    }

    /// LOGOUT and disconnect. The session is Disconnected afterwards
    /// even if the tagged response never arrives.
    pub async fn logout(&mut self) -> Result<()> {
        self.require_open()?;
        self.state = SessionState::LoggingOut;
        let result = self.engine.execute(&command::logout(), None).await;
        self.state = SessionState::Disconnected;
        self.selected = None;
        match result {
            Ok(_) => {
                info!("logged out");
                Ok(())
            }
            // The server may drop the connection right after BYE.
            Err(Error::Network { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // -- change notification --

    /// Enter IDLE (RFC 2177). Requires the capability, a selected
    /// mailbox, and no other active watch.
    pub async fn idle(&mut self) -> Result<MailboxWatch> {
        self.require_selected()?;
        if self.capabilities.is_known() && !self.capabilities.has("IDLE") {
            return Err(Error::protocol(
                "server does not advertise IDLE",
                String::new(),
            ));
        }
        MailboxWatch::start_idle(self.engine.clone(), self.watch_active.clone()).await
    }

    /// Watch for changes: IDLE when the server supports it, NOOP
    /// polling at `poll_interval` otherwise.
    pub async fn watch(&mut self, poll_interval: Duration) -> Result<MailboxWatch> {
        self.require_selected()?;
        if self.capabilities.has("IDLE") {
            return self.idle().await;
        }
        MailboxWatch::start_polling(
            self.engine.clone(),
            self.watch_active.clone(),
            poll_interval,
        )
    }
}
