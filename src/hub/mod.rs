//! Hub connection state machine.
//!
//! A [`HubSession`] drives one hub: socket lifecycle, the
//! `Disconnected → Connecting → Protocol → Identify → Verify → Normal` state
//! machine, incoming flood defense, outgoing search pacing, the user table
//! and the message cache. The wire dialect is behind the
//! [`ProtocolAdaptor`] trait with ADC and NMDC implementations; adaptors turn
//! raw lines into [`ProtocolEvent`]s and session intents into raw lines, so
//! the state machine itself is protocol-agnostic (and testable without a
//! socket).

pub mod adc;
pub mod message_cache;
pub mod nmdc;
pub mod search_queue;
pub mod user;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::sync::Arc;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::error::{Error, HubError, Result};
use crate::flood::{FloodCounter, FloodKind, FloodLimits};
use crate::share::SearchQuery;
use crate::tth::Tth;
use crate::types::{ChatMessage, ConnectionState, Event, MessageSeverity, StatusMessage};
use crate::utils::now_ms;

use message_cache::MessageCache;
use search_queue::{PendingSearch, SearchQueue};
use user::{Identity, UserCounts, UserTable};

/// Incoming flood window
pub const FLOOD_PERIOD_SECS: u64 = 60;

/// CTM limits for regular peers
pub const CTM_LIMITS: FloodLimits = FloodLimits {
    minor_count: 15,
    severe_count: 40,
};

/// CTM limits for MCN-capable peers, which legitimately connect often
pub const CTM_LIMITS_MCN: FloodLimits = FloodLimits {
    minor_count: 100,
    severe_count: 150,
};

/// Search limits
pub const SEARCH_LIMITS: FloodLimits = FloodLimits {
    minor_count: 20,
    severe_count: 60,
};

/// Reconnect delay applied after a severe flood
const FLOOD_RECONNECT_SECS: u64 = 10 * 60;

/// Parsed PBD parameters carried over the wire
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PbdParams {
    /// Content hash
    pub tth: Option<Tth>,
    /// Remote bundle token
    pub bundle: Option<u32>,
    /// Peer wants to be notified of finished pieces (`UP1`)
    pub update: bool,
    /// Peer adds us as a partial source (`AD1`)
    pub add: bool,
    /// Peer's bundle finished, drop the subscription (`RM1`)
    pub remove: bool,
}

/// Event produced by a protocol adaptor from one wire line
#[derive(Clone, Debug)]
pub enum ProtocolEvent {
    /// Protocol negotiation finished; identify next
    Handshaken,
    /// The hub demands a password
    Password,
    /// Login complete; our identity as the hub sees it
    LoggedIn(Identity),
    /// The hub redirected us
    Redirect(String),
    /// A user appeared or changed
    UserUpdated {
        /// Hub-local short id
        sid: u32,
        /// Advertised identity
        identity: Identity,
    },
    /// A user left
    UserQuit(u32),
    /// Main-chat message
    ChatMessage(ChatMessage),
    /// Private message
    PrivateMessage(ChatMessage),
    /// Incoming search request
    Search {
        /// Sender short id when known
        sid: Option<u32>,
        /// Sender address used for flood accounting
        ip: String,
        /// Parsed query
        query: SearchQuery,
        /// Reply token
        token: String,
    },
    /// Incoming search response
    SearchResult {
        /// Responder's client id when known
        cid: Option<crate::types::Cid>,
        /// Responder's nick
        nick: String,
        /// Announced file name
        path: String,
        /// Announced size
        size: u64,
        /// Announced free slots
        slots: u32,
        /// Content hash, when carried
        tth: Option<Tth>,
        /// Echoed search token
        token: String,
    },
    /// Incoming connect-to-me
    Ctm {
        /// Target address
        ip: String,
        /// Target port
        port: u16,
        /// Protocol token
        token: String,
        /// Sender short id when known
        sid: Option<u32>,
    },
    /// Incoming reverse connect-to-me (passive peer)
    Rcm {
        /// Sender short id when known
        sid: Option<u32>,
        /// Protocol token
        token: String,
    },
    /// Incoming partial-bundle discovery exchange
    Pbd(PbdParams),
    /// The adaptor wants this raw line sent (handshake replies)
    Reply(String),
    /// Unrecoverable protocol failure
    Failed(String),
}

/// Wire dialect behind a hub session
pub trait ProtocolAdaptor: Send {
    /// Lines to send as soon as the socket is up
    fn initial_lines(&mut self, identity: &Identity) -> Vec<String>;

    /// Lines advertising our identity
    fn send_info(&mut self, identity: &Identity) -> Vec<String>;

    /// Lines for one outbound search
    fn send_search(&mut self, search: &PendingSearch) -> Vec<String>;

    /// Lines answering a password demand
    fn send_password(&mut self, password: &str) -> Vec<String>;

    /// Lines for a chat message
    fn send_message(&mut self, text: &str, third_person: bool) -> Vec<String>;

    /// Parse one incoming line into events
    fn parse_line(&mut self, line: &str) -> Vec<ProtocolEvent>;

    /// Message separator on the wire
    fn separator(&self) -> u8;
}

/// A request forwarded out of the session for other components to answer
#[derive(Clone, Debug)]
pub enum HubRequest {
    /// A peer searches; the content index answers
    Search {
        /// Parsed query
        query: SearchQuery,
        /// Reply token
        token: String,
        /// Peer address
        ip: String,
    },
    /// A peer answered one of our searches
    SearchResult {
        /// The responding source
        user: crate::types::HintedUser,
        /// Announced file name
        path: String,
        /// Announced size
        size: u64,
        /// Announced free slots
        slots: u32,
        /// Content hash, when carried
        tth: Option<Tth>,
        /// Echoed search token
        token: String,
    },
    /// A peer wants a transfer connection
    Ctm {
        /// Target address
        ip: String,
        /// Target port
        port: u16,
        /// Protocol token
        token: String,
    },
    /// A passive peer asks us to connect out
    Rcm {
        /// Protocol token
        token: String,
    },
    /// Partial-bundle discovery
    Pbd(PbdParams),
}

struct SessionState {
    connect_state: ConnectionState,
    users: UserTable,
    search_queue: SearchQueue,
    cache: MessageCache,
    ctm_flood: FloodCounter,
    search_flood: FloodCounter,
    /// Current delay before the next reconnect attempt
    reconnect_secs: u64,
    auto_reconnect: bool,
    redirect_target: Option<String>,
    last_activity_ms: u64,
    counts: UserCounts,
}

struct HubInner {
    url: String,
    secure: bool,
    host: String,
    port: u16,
    keyprint: Option<String>,
    config: HubConfig,
    identity: RwLock<Identity>,
    password: RwLock<Option<String>>,
    adaptor: Mutex<Box<dyn ProtocolAdaptor>>,
    state: RwLock<SessionState>,
    outbox_tx: mpsc::UnboundedSender<String>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    request_sink: std::sync::RwLock<Option<mpsc::UnboundedSender<HubRequest>>>,
    event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Cancels the current socket; replaced on every connect
    socket_cancel: Mutex<CancellationToken>,
    session_cancel: CancellationToken,
}

/// One hub session (cloneable; all state is shared)
#[derive(Clone)]
pub struct HubSession {
    inner: Arc<HubInner>,
}

impl HubSession {
    /// Create a session for a hub URL. The scheme picks the dialect:
    /// `adc://` / `adcs://` for ADC, `dchub://` / `nmdcs://` for NMDC.
    pub fn new(
        url: &str,
        config: HubConfig,
        event_tx: tokio::sync::broadcast::Sender<Event>,
    ) -> Result<Self> {
        let parsed = url::Url::parse(url).map_err(|e| HubError::InvalidUrl(e.to_string()))?;
        let (adaptor, secure): (Box<dyn ProtocolAdaptor>, bool) = match parsed.scheme() {
            "adc" => (Box::new(adc::AdcProtocol::new()), false),
            "adcs" => (Box::new(adc::AdcProtocol::new()), true),
            "dchub" | "nmdc" => (Box::new(nmdc::NmdcProtocol::new(&config.nick)), false),
            "nmdcs" => (Box::new(nmdc::NmdcProtocol::new(&config.nick)), true),
            other => {
                return Err(HubError::InvalidUrl(format!("unsupported scheme {other}")).into());
            }
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| HubError::InvalidUrl("missing host".into()))?
            .to_string();
        let port = parsed.port().unwrap_or(411);
        let keyprint = parsed
            .query_pairs()
            .find(|(k, _)| k == "kp")
            .map(|(_, v)| v.into_owned());

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let identity = Identity {
            nick: config.nick.clone(),
            description: config.description.clone(),
            ..Identity::default()
        };

        Ok(Self {
            inner: Arc::new(HubInner {
                url: url.to_string(),
                secure,
                host,
                port,
                keyprint,
                identity: RwLock::new(identity),
                adaptor: Mutex::new(adaptor),
                state: RwLock::new(SessionState {
                    connect_state: ConnectionState::Disconnected,
                    users: UserTable::default(),
                    search_queue: SearchQueue::new(config.search_interval_secs * 1000),
                    cache: MessageCache::new(config.message_cache_size),
                    ctm_flood: FloodCounter::new(FLOOD_PERIOD_SECS),
                    search_flood: FloodCounter::new(FLOOD_PERIOD_SECS),
                    reconnect_secs: config.reconnect_secs,
                    auto_reconnect: true,
                    redirect_target: None,
                    last_activity_ms: 0,
                    counts: UserCounts::default(),
                }),
                config,
                password: RwLock::new(None),
                outbox_tx,
                outbox_rx: Mutex::new(Some(outbox_rx)),
                request_sink: std::sync::RwLock::new(None),
                event_tx,
                socket_cancel: Mutex::new(CancellationToken::new()),
                session_cancel: CancellationToken::new(),
            }),
        })
    }

    /// The hub URL
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Wire the sink that receives searches, CTMs and PBD requests
    pub fn set_request_sink(&self, sink: mpsc::UnboundedSender<HubRequest>) {
        *self
            .inner
            .request_sink
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    /// Store the hub password, used to answer the next demand
    pub async fn set_password(&self, password: impl Into<String>) {
        *self.inner.password.write().await = Some(password.into());
    }

    /// Current connection state
    pub async fn connect_state(&self) -> ConnectionState {
        self.inner.state.read().await.connect_state
    }

    /// Current user counts
    pub async fn user_counts(&self) -> UserCounts {
        self.inner.state.read().await.counts
    }

    /// Users currently online
    pub async fn user_count(&self) -> usize {
        self.inner.state.read().await.users.len()
    }

    /// Unread chat messages in the cache
    pub async fn unread_count(&self) -> usize {
        self.inner.state.read().await.cache.unread_count()
    }

    /// Mark cached chat read
    pub async fn mark_read(&self) -> usize {
        self.inner.state.write().await.cache.mark_read()
    }

    /// Where the hub redirected us, if it did
    pub async fn redirect_target(&self) -> Option<String> {
        self.inner.state.read().await.redirect_target.clone()
    }

    // -----------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------

    /// Open (or reopen) the hub socket
    pub async fn connect(&self) {
        // Tear down whatever socket exists.
        self.disconnect_internal(false, None).await;

        {
            let mut state = self.inner.state.write().await;
            state.connect_state = ConnectionState::Connecting;
            state.auto_reconnect = true;
            state.last_activity_ms = now_ms();
        }
        self.emit_state(ConnectionState::Connecting);

        let cancel = {
            let mut slot = self.inner.socket_cancel.lock().await;
            *slot = self.inner.session_cancel.child_token();
            slot.clone()
        };
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.run_socket(cancel).await {
                tracing::debug!(url = session.inner.url, error = %e, "hub socket ended");
                session.on_socket_failed(&e.to_string()).await;
            }
        });
    }

    /// Graceful disconnect requested by the user
    pub async fn disconnect(&self) {
        self.disconnect_internal(true, None).await;
    }

    /// Stop the session for good
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.write().await;
            state.auto_reconnect = false;
        }
        self.inner.session_cancel.cancel();
        self.disconnect_internal(true, None).await;
    }

    async fn disconnect_internal(&self, clear_auto_reconnect: bool, delay_override: Option<u64>) {
        self.inner.socket_cancel.lock().await.cancel();
        let was_connected = {
            let mut state = self.inner.state.write().await;
            let was = state.connect_state != ConnectionState::Disconnected;
            state.connect_state = ConnectionState::Disconnected;
            state.users.clear();
            state.counts = UserCounts::default();
            // A pending outbound search dies with the session.
            state.search_queue.clear();
            if clear_auto_reconnect {
                state.auto_reconnect = false;
            }
            if let Some(delay) = delay_override {
                state.reconnect_secs = delay;
            }
            state.last_activity_ms = now_ms();
            was
        };
        if was_connected {
            self.emit_state(ConnectionState::Disconnected);
        }
    }

    async fn on_socket_failed(&self, reason: &str) {
        let jitter: u64 = rand::thread_rng().gen_range(0..60);
        let delay = self.inner.config.reconnect_secs + jitter;
        self.status(
            format!("connection lost: {reason}"),
            MessageSeverity::Error,
        )
        .await;
        let mut state = self.inner.state.write().await;
        if state.connect_state == ConnectionState::Disconnected {
            return;
        }
        state.connect_state = ConnectionState::Disconnected;
        state.users.clear();
        state.counts = UserCounts::default();
        state.search_queue.clear();
        state.reconnect_secs = state.reconnect_secs.max(delay);
        state.last_activity_ms = now_ms();
        drop(state);
        self.emit_state(ConnectionState::Disconnected);
    }

    /// Second tick: reconnection and search pacing
    pub async fn tick(&self, now: u64) {
        let (reconnect, search) = {
            let mut state = self.inner.state.write().await;
            match state.connect_state {
                ConnectionState::Disconnected => {
                    let due = state.auto_reconnect
                        && now > state.last_activity_ms + state.reconnect_secs * 1000;
                    (due, None)
                }
                ConnectionState::Normal => (false, state.search_queue.maybe_pop(now)),
                _ => (false, None),
            }
        };

        if reconnect {
            tracing::info!(url = self.inner.url, "reconnecting");
            self.connect().await;
            return;
        }
        if let Some(search) = search {
            let lines = {
                let mut adaptor = self.inner.adaptor.lock().await;
                adaptor.send_search(&search)
            };
            for line in lines {
                let _ = self.inner.outbox_tx.send(line);
            }
            let _ = self.inner.event_tx.send(Event::OutgoingSearch {
                url: self.inner.url.clone(),
                query: search
                    .query
                    .tth
                    .map(|t| format!("TR:{t}"))
                    .unwrap_or_else(|| search.query.include.join(" ")),
            });
        }
    }

    /// Queue an outbound search
    pub async fn queue_search(&self, search: PendingSearch) -> Result<()> {
        let mut state = self.inner.state.write().await;
        if state.connect_state != ConnectionState::Normal {
            return Err(HubError::NotConnected {
                url: self.inner.url.clone(),
            }
            .into());
        }
        state.search_queue.queue(search);
        Ok(())
    }

    /// Send a chat message
    pub async fn send_message(&self, text: &str, third_person: bool) -> Result<()> {
        {
            let state = self.inner.state.read().await;
            if state.connect_state != ConnectionState::Normal {
                return Err(HubError::NotConnected {
                    url: self.inner.url.clone(),
                }
                .into());
            }
        }
        let lines = {
            let mut adaptor = self.inner.adaptor.lock().await;
            adaptor.send_message(text, third_person)
        };
        for line in lines {
            let _ = self.inner.outbox_tx.send(line);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Line handling (driven by the socket task, directly by tests)
    // -----------------------------------------------------------------

    /// Feed one incoming line through the adaptor into the state machine
    pub async fn handle_line(&self, line: &str) {
        {
            let mut state = self.inner.state.write().await;
            state.last_activity_ms = now_ms();
        }
        let events = {
            let mut adaptor = self.inner.adaptor.lock().await;
            adaptor.parse_line(line)
        };
        for event in events {
            self.apply_event(event).await;
        }
    }

    /// Socket established: move to `Protocol` and start the handshake
    pub async fn on_socket_connected(&self) {
        {
            let mut state = self.inner.state.write().await;
            state.connect_state = ConnectionState::Protocol;
            // A successful connection resets the backoff.
            state.reconnect_secs = self.inner.config.reconnect_secs;
        }
        self.emit_state(ConnectionState::Protocol);
        let identity = self.inner.identity.read().await.clone();
        let lines = {
            let mut adaptor = self.inner.adaptor.lock().await;
            adaptor.initial_lines(&identity)
        };
        for line in lines {
            let _ = self.inner.outbox_tx.send(line);
        }
    }

    async fn apply_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Reply(line) => {
                let _ = self.inner.outbox_tx.send(line);
            }
            ProtocolEvent::Handshaken => {
                {
                    let mut state = self.inner.state.write().await;
                    if state.connect_state != ConnectionState::Protocol {
                        return;
                    }
                    state.connect_state = ConnectionState::Identify;
                }
                self.emit_state(ConnectionState::Identify);
                let identity = self.inner.identity.read().await.clone();
                let lines = {
                    let mut adaptor = self.inner.adaptor.lock().await;
                    adaptor.send_info(&identity)
                };
                for line in lines {
                    let _ = self.inner.outbox_tx.send(line);
                }
            }
            ProtocolEvent::Password => {
                {
                    let mut state = self.inner.state.write().await;
                    state.connect_state = ConnectionState::Verify;
                }
                self.emit_state(ConnectionState::Verify);
                let stored = self.inner.password.read().await.clone();
                match stored {
                    Some(password) => {
                        let lines = {
                            let mut adaptor = self.inner.adaptor.lock().await;
                            adaptor.send_password(&password)
                        };
                        for line in lines {
                            let _ = self.inner.outbox_tx.send(line);
                        }
                    }
                    None => {
                        self.status(
                            "hub requires a password".to_string(),
                            MessageSeverity::Warning,
                        )
                        .await;
                    }
                }
            }
            ProtocolEvent::LoggedIn(identity) => {
                {
                    let mut state = self.inner.state.write().await;
                    state.connect_state = ConnectionState::Normal;
                    state.counts = state.users.counts();
                }
                *self.inner.identity.write().await = identity.clone();
                self.emit_state(ConnectionState::Normal);
                // Entering NORMAL sends fresh client info.
                let lines = {
                    let mut adaptor = self.inner.adaptor.lock().await;
                    adaptor.send_info(&identity)
                };
                for line in lines {
                    let _ = self.inner.outbox_tx.send(line);
                }
                tracing::info!(url = self.inner.url, nick = identity.nick, "logged in");
            }
            ProtocolEvent::Redirect(target) => {
                {
                    let mut state = self.inner.state.write().await;
                    state.redirect_target = Some(target.clone());
                }
                self.status(format!("redirected to {target}"), MessageSeverity::Info)
                    .await;
                let _ = self.inner.event_tx.send(Event::HubRedirect {
                    url: self.inner.url.clone(),
                    target,
                });
                self.disconnect_internal(true, None).await;
            }
            ProtocolEvent::UserUpdated { sid, identity } => {
                let mut state = self.inner.state.write().await;
                state.users.put(sid, identity);
                if state.connect_state == ConnectionState::Normal {
                    state.counts = state.users.counts();
                }
            }
            ProtocolEvent::UserQuit(sid) => {
                let mut state = self.inner.state.write().await;
                state.users.remove(sid);
                state.counts = state.users.counts();
            }
            ProtocolEvent::ChatMessage(message) | ProtocolEvent::PrivateMessage(message) => {
                {
                    let mut state = self.inner.state.write().await;
                    state.cache.push_chat(message.clone());
                }
                let _ = self.inner.event_tx.send(Event::HubMessage {
                    url: self.inner.url.clone(),
                    message,
                });
            }
            ProtocolEvent::Search {
                sid: _,
                ip,
                query,
                token,
            } => {
                if !self.check_search_flood(&ip).await {
                    return;
                }
                self.forward(HubRequest::Search { query, token, ip });
            }
            ProtocolEvent::Ctm {
                ip,
                port,
                token,
                sid,
            } => {
                let mcn = {
                    let state = self.inner.state.read().await;
                    sid.and_then(|s| state.users.get(s))
                        .is_some_and(|u| u.identity.mcn)
                };
                if !self.check_ctm_flood(&ip, mcn).await {
                    return;
                }
                self.forward(HubRequest::Ctm { ip, port, token });
            }
            ProtocolEvent::SearchResult {
                cid,
                nick,
                path,
                size,
                slots,
                tth,
                token,
            } => {
                // NMDC peers carry no client id; derive a stable one from the
                // nick and hub so the queue can track the source.
                let cid = cid.unwrap_or_else(|| {
                    let seed = format!("{}@{}", nick, self.inner.url);
                    crate::types::Cid(crate::tth::hash_buffer(seed.as_bytes()).root().0)
                });
                self.forward(HubRequest::SearchResult {
                    user: crate::types::HintedUser::new(cid, nick, self.inner.url.clone()),
                    path,
                    size,
                    slots,
                    tth,
                    token,
                });
            }
            ProtocolEvent::Rcm { sid: _, token } => {
                self.forward(HubRequest::Rcm { token });
            }
            ProtocolEvent::Pbd(params) => {
                self.forward(HubRequest::Pbd(params));
            }
            ProtocolEvent::Failed(reason) => {
                self.on_socket_failed(&reason).await;
            }
        }
    }

    fn forward(&self, request: HubRequest) {
        if let Some(sink) = self
            .inner
            .request_sink
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            && sink.send(request).is_err()
        {
            tracing::debug!("hub request sink closed");
        }
    }

    async fn check_ctm_flood(&self, ip: &str, mcn: bool) -> bool {
        let limits = if mcn { CTM_LIMITS_MCN } else { CTM_LIMITS };
        self.check_flood_with(ip, limits, "connect request spam")
            .await
    }

    async fn check_search_flood(&self, ip: &str) -> bool {
        let now = now_ms();
        let (result, message) = {
            let mut state = self.inner.state.write().await;
            let result = state.search_flood.handle_request(ip, SEARCH_LIMITS, now);
            let message = state.search_flood.append_rate(ip, "search spam");
            (result, message)
        };
        self.handle_flood_result(ip, result, message).await
    }

    async fn check_flood_with(&self, ip: &str, limits: FloodLimits, label: &str) -> bool {
        let now = now_ms();
        let (result, message) = {
            let mut state = self.inner.state.write().await;
            let result = state.ctm_flood.handle_request(ip, limits, now);
            let message = state.ctm_flood.append_rate(ip, label);
            (result, message)
        };
        self.handle_flood_result(ip, result, message).await
    }

    async fn handle_flood_result(
        &self,
        ip: &str,
        result: crate::flood::FloodResult,
        message: String,
    ) -> bool {
        match result.kind {
            FloodKind::Ok => true,
            FloodKind::Minor => {
                // Report only on the exact crossing to keep the backlog quiet.
                if result.hit_limit {
                    self.status(message, MessageSeverity::Verbose).await;
                }
                false
            }
            FloodKind::Severe => {
                if result.hit_limit {
                    self.status(
                        format!("disconnecting after a severe flood: {message}"),
                        MessageSeverity::Error,
                    )
                    .await;
                    tracing::warn!(url = self.inner.url, ip, "severe flood, backing off");
                    self.disconnect_internal(false, Some(FLOOD_RECONNECT_SECS))
                        .await;
                    {
                        // The severe backoff still reconnects eventually.
                        let mut state = self.inner.state.write().await;
                        state.auto_reconnect = true;
                    }
                }
                false
            }
        }
    }

    async fn status(&self, text: String, severity: MessageSeverity) {
        let message = StatusMessage {
            text,
            severity,
            time: chrono::Utc::now(),
        };
        {
            let mut state = self.inner.state.write().await;
            state.cache.push_status(message.clone());
        }
        let _ = self.inner.event_tx.send(Event::HubStatus {
            url: self.inner.url.clone(),
            message,
        });
    }

    fn emit_state(&self, state: ConnectionState) {
        let _ = self.inner.event_tx.send(Event::HubState {
            url: self.inner.url.clone(),
            state,
        });
    }

    // -----------------------------------------------------------------
    // Socket plumbing
    // -----------------------------------------------------------------

    async fn run_socket(&self, cancel: CancellationToken) -> Result<()> {
        let address = format!("{}:{}", self.inner.host, self.inner.port);
        let tcp = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| Error::from(HubError::ConnectFailed(e.to_string())))?;

        if self.inner.secure {
            let tls = self.tls_handshake(tcp).await?;
            self.drive_stream(tls, cancel).await
        } else {
            self.drive_stream(tcp, cancel).await
        }
    }

    async fn tls_handshake(
        &self,
        tcp: tokio::net::TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<tokio::net::TcpStream>> {
        use tokio_rustls::rustls;

        // Hubs run self-signed certificates; trust is pinned by keyprint.
        #[derive(Debug)]
        struct AcceptAll;
        impl rustls::client::danger::ServerCertVerifier for AcceptAll {
            fn verify_server_cert(
                &self,
                _end_entity: &rustls::pki_types::CertificateDer<'_>,
                _intermediates: &[rustls::pki_types::CertificateDer<'_>],
                _server_name: &rustls::pki_types::ServerName<'_>,
                _ocsp: &[u8],
                _now: rustls::pki_types::UnixTime,
            ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error>
            {
                Ok(rustls::client::danger::ServerCertVerified::assertion())
            }

            fn verify_tls12_signature(
                &self,
                _message: &[u8],
                _cert: &rustls::pki_types::CertificateDer<'_>,
                _dss: &rustls::DigitallySignedStruct,
            ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
            {
                Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
            }

            fn verify_tls13_signature(
                &self,
                _message: &[u8],
                _cert: &rustls::pki_types::CertificateDer<'_>,
                _dss: &rustls::DigitallySignedStruct,
            ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
            {
                Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
            }

            fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
                vec![
                    rustls::SignatureScheme::RSA_PKCS1_SHA256,
                    rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
                    rustls::SignatureScheme::ED25519,
                    rustls::SignatureScheme::RSA_PSS_SHA256,
                ]
            }
        }

        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAll))
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let server_name = rustls::pki_types::ServerName::try_from(self.inner.host.clone())
            .map_err(|e| HubError::ConnectFailed(e.to_string()))?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::from(HubError::ConnectFailed(e.to_string())))?;

        // Pinned keyprint check against the presented certificate.
        if let Some(expected) = &self.inner.keyprint {
            use sha2::Digest;
            let presented = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| {
                    let digest = sha2::Sha256::digest(cert.as_ref());
                    format!("SHA256/{}", data_encoding::BASE32_NOPAD.encode(&digest))
                });
            if presented.as_deref() != Some(expected.as_str()) {
                {
                    let mut state = self.inner.state.write().await;
                    state.auto_reconnect = false;
                }
                self.status(
                    "certificate keyprint mismatch".to_string(),
                    MessageSeverity::Error,
                )
                .await;
                return Err(HubError::KeyprintMismatch {
                    url: self.inner.url.clone(),
                }
                .into());
            }
        }
        Ok(stream)
    }

    async fn drive_stream<S>(&self, stream: S, cancel: CancellationToken) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        self.on_socket_connected().await;
        let separator = {
            let adaptor = self.inner.adaptor.lock().await;
            adaptor.separator()
        };

        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut outbox = self
            .inner
            .outbox_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Other("hub socket already driven".into()))?;

        let result = loop {
            let mut buf = Vec::new();
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                line = reader.read_until(separator, &mut buf) => {
                    match line {
                        Ok(0) => break Err(HubError::ConnectFailed("closed by hub".into()).into()),
                        Ok(_) => {
                            buf.pop();
                            let text = String::from_utf8_lossy(&buf);
                            let trimmed = text.trim_end_matches(['\r', '\n']);
                            if !trimmed.is_empty() {
                                self.handle_line(trimmed).await;
                            }
                        }
                        Err(e) => break Err(Error::from(e)),
                    }
                }
                outgoing = outbox.recv() => {
                    match outgoing {
                        Some(line) => {
                            let mut bytes = line.into_bytes();
                            bytes.push(separator);
                            if let Err(e) = write_half.write_all(&bytes).await {
                                break Err(Error::from(e));
                            }
                        }
                        None => break Ok(()),
                    }
                }
            }
        };

        // Hand the outbox back for the next connection attempt.
        *self.inner.outbox_rx.lock().await = Some(outbox);
        result
    }

    /// Take the next queued outbound line (handshake testing)
    #[cfg(test)]
    pub(crate) async fn take_outbound(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut slot = self.inner.outbox_rx.lock().await;
        if let Some(rx) = slot.as_mut() {
            while let Ok(line) = rx.try_recv() {
                out.push(line);
            }
        }
        out
    }
}
