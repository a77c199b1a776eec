//! Server-side connection state.
//!
//! A [`Connection`] moves through `Connecting → Open → Closing → Closed`.
//! The lifecycle lock serializes the three operations that must not race
//! teardown: authentication, topic joins, and close-hook registration. Once
//! the state leaves `Open` none of them take effect.

use std::sync::Arc;
use std::time::Instant as StdInstant;

use parking_lot::{Mutex, RwLock};
use rally_core::{ConnectionId, Frame, Identity, Message, Outbox};
use rally_rpc::{ListenerRegistry, MethodRegistry, RpcPeer};
use tokio::time::Instant;
use tracing::trace;

use crate::context::Context;
use crate::groups::GroupMember;

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, not yet registered.
    Connecting,
    /// Registered and serving calls.
    Open,
    /// Teardown in progress.
    Closing,
    /// Teardown finished (terminal).
    Closed,
}

/// Why a connection was torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent a close frame or the stream ended.
    ClientClosed,
    /// The transport reported an error.
    TransportError,
    /// An inbound frame could not be decoded.
    DecodeFailure,
    /// The peer missed a heartbeat probe.
    HeartbeatTimeout,
    /// Closed by a handler or the server application.
    ClosedByServer,
    /// The server is shutting down.
    Shutdown,
}

impl DisconnectReason {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::DecodeFailure => "decode_failure",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ClosedByServer => "closed_by_server",
            Self::Shutdown => "shutdown",
        }
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// One WebSocket peer as seen by the server.
pub struct Connection {
    id: ConnectionId,
    peer: RpcPeer<Context>,
    outbox: Outbox,
    state: Mutex<ConnectionState>,
    identity: RwLock<Option<Identity>>,
    last_ping_sent_at: Mutex<Option<Instant>>,
    last_pong_received_at: Mutex<Option<Instant>>,
    close_reason: Mutex<Option<DisconnectReason>>,
    close_hooks: Mutex<Vec<CloseHook>>,
    connected_at: StdInstant,
}

impl Connection {
    /// Create a connection in the `Connecting` state, bound to `outbox`.
    pub fn new(
        outbox: Outbox,
        methods: Arc<MethodRegistry<Context>>,
        listeners: Arc<ListenerRegistry<Context>>,
    ) -> Self {
        let peer = RpcPeer::new(methods, listeners);
        peer.attach(outbox.clone());
        Self {
            id: ConnectionId::new(),
            peer,
            outbox,
            state: Mutex::new(ConnectionState::Connecting),
            identity: RwLock::new(None),
            last_ping_sent_at: Mutex::new(None),
            last_pong_received_at: Mutex::new(None),
            close_reason: Mutex::new(None),
            close_hooks: Mutex::new(Vec::new()),
            connected_at: StdInstant::now(),
        }
    }

    /// Unique connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Correlation engine for this connection.
    pub fn peer(&self) -> &RpcPeer<Context> {
        &self.peer
    }

    /// Outbound frame queue.
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether the connection is `Open`.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Identity recorded by the last successful authentication.
    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    /// Frames dropped because the outbound queue was full.
    pub fn drop_count(&self) -> u64 {
        self.outbox.drop_count()
    }

    // ── Heartbeat bookkeeping ───────────────────────────────────────────

    /// Queue a `Ping` and record when it was sent.
    pub fn send_ping(&self) -> bool {
        *self.last_ping_sent_at.lock() = Some(Instant::now());
        self.outbox.send(&Message::Ping)
    }

    /// Record a pong-equivalent `Ping` from the peer.
    pub fn mark_pong(&self) {
        trace!(conn_id = %self.id, "pong received");
        *self.last_pong_received_at.lock() = Some(Instant::now());
    }

    /// Whether the peer has answered since the last probe was sent.
    pub fn pong_since_last_ping(&self) -> bool {
        let ping = *self.last_ping_sent_at.lock();
        let pong = *self.last_pong_received_at.lock();
        match (ping, pong) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(ping), Some(pong)) => pong >= ping,
        }
    }

    // ── Close ───────────────────────────────────────────────────────────

    /// Ask the session to close this connection.
    ///
    /// Closes the outbox, which stops the writer and heartbeat and wakes the
    /// read loop. The first reason recorded wins.
    pub fn request_close(&self, reason: DisconnectReason) {
        let _ = self.close_reason.lock().get_or_insert(reason);
        self.outbox.close();
    }

    /// Reason passed to the first [`Connection::request_close`].
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        *self.close_reason.lock()
    }

    /// Run `hook` once when the connection is torn down.
    ///
    /// Runs immediately if teardown has already started.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let state = self.state.lock();
            if matches!(*state, ConnectionState::Connecting | ConnectionState::Open) {
                self.close_hooks.lock().push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    // ── Lifecycle transitions (driven by ServerState) ───────────────────

    /// `Connecting → Open`.
    pub(crate) fn mark_open(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Open;
        }
    }

    /// Run `f` while holding the lifecycle lock, only if the connection is
    /// `Open`.
    pub(crate) fn with_open<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let state = self.state.lock();
        (*state == ConnectionState::Open).then(f)
    }

    /// Enter `Closing`. Returns `false` if teardown already started.
    pub(crate) fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
            return false;
        }
        *state = ConnectionState::Closing;
        true
    }

    /// `Closing → Closed`.
    pub(crate) fn finish_close(&self) {
        *self.state.lock() = ConnectionState::Closed;
    }

    pub(crate) fn replace_identity(&self, identity: Identity) -> Option<Identity> {
        self.identity.write().replace(identity)
    }

    pub(crate) fn take_identity(&self) -> Option<Identity> {
        self.identity.write().take()
    }

    /// Drain and run every registered close hook.
    pub(crate) fn run_close_hooks(&self) -> usize {
        let hooks = std::mem::take(&mut *self.close_hooks.lock());
        let count = hooks.len();
        for hook in hooks {
            hook();
        }
        count
    }
}

impl GroupMember for Arc<Connection> {
    fn member_id(&self) -> &ConnectionId {
        &self.id
    }

    fn deliver(&self, frame: Frame) -> bool {
        self.outbox.send_frame(frame)
    }
}
