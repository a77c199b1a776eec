//! Per-connection handle passed to every server function and listener.

use std::sync::Arc;

use rally_core::{ConnectionId, Identity};
use rally_rpc::{CallError, HandlerError};
use serde_json::Value;

use crate::presence::PresenceTracker;
use crate::state::ServerState;
use crate::websocket::connection::{Connection, DisconnectReason};

/// The calling connection plus access to server-wide state.
///
/// Cheap to clone. A handler that awaits should check [`Context::is_live`]
/// before acting on its connection afterwards; group and auth operations on
/// a connection that has started teardown are ignored.
#[derive(Clone)]
pub struct Context {
    connection: Arc<Connection>,
    state: Arc<ServerState>,
}

impl Context {
    pub(crate) fn new(connection: Arc<Connection>, state: Arc<ServerState>) -> Self {
        Self { connection, state }
    }

    /// Connection this context belongs to.
    pub fn id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Server-wide state.
    pub fn server(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Whether the connection is still open.
    pub fn is_live(&self) -> bool {
        self.connection.is_open()
    }

    // ── Identity ────────────────────────────────────────────────────────

    /// Identity recorded by the last successful `auth`.
    pub fn identity(&self) -> Option<Identity> {
        self.connection.identity()
    }

    /// Authenticated user id, if any.
    pub fn user_id(&self) -> Option<String> {
        self.identity().map(|i| i.user_id)
    }

    /// Authenticated user name, if any.
    pub fn user_name(&self) -> Option<String> {
        self.identity().map(|i| i.user_name)
    }

    /// Whether the connection is authenticated as an admin.
    pub fn is_admin(&self) -> bool {
        self.identity().is_some_and(|i| i.is_admin)
    }

    /// The identity, or [`HandlerError::NotAuthorized`].
    pub fn require_user(&self) -> Result<Identity, HandlerError> {
        self.identity().ok_or(HandlerError::NotAuthorized)
    }

    /// The identity if it is an admin, or [`HandlerError::NotAuthorized`].
    pub fn require_admin(&self) -> Result<Identity, HandlerError> {
        self.identity()
            .filter(|i| i.is_admin)
            .ok_or(HandlerError::NotAuthorized)
    }

    /// Record `identity` on this connection and update presence.
    ///
    /// Presence listeners run synchronously before this returns, after the
    /// connection's lifecycle lock is released. Returns `false` if the
    /// connection is no longer open.
    pub fn authenticate(&self, identity: Identity) -> bool {
        self.state.authenticate(&self.connection, identity)
    }

    // ── Groups ──────────────────────────────────────────────────────────

    /// Join `topic`. Returns `false` if already a member or no longer live.
    pub fn join(&self, topic: &str) -> bool {
        self.state.join(&self.connection, topic)
    }

    /// Leave `topic`. Returns `false` if not a member.
    pub fn leave(&self, topic: &str) -> bool {
        self.state.groups().leave(self.connection.id(), topic)
    }

    /// Topics this connection belongs to, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.state.groups().topics_of(self.connection.id())
    }

    /// Send an `Event` to every member of `topic`, including this connection
    /// if it is one.
    pub fn broadcast(&self, topic: &str, method: &str, params: Vec<Value>) -> usize {
        self.state.broadcast(topic, method, params)
    }

    /// Invoke `f` with the context of every member of `topic`.
    pub fn for_each_member(&self, topic: &str, f: impl FnMut(Context)) {
        self.state.for_each_member(topic, f);
    }

    /// Members in `topic`; zero if it does not exist.
    pub fn member_count(&self, topic: &str) -> usize {
        self.state.groups().member_count(topic)
    }

    /// Presence tracker shared by every connection.
    pub fn presence(&self) -> &PresenceTracker {
        self.state.presence()
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Send an `Event` to this connection only.
    pub fn emit(&self, method: &str, params: Vec<Value>) -> bool {
        self.connection.peer().emit(method, params)
    }

    /// Call a function registered on this connection's client.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        self.connection.peer().call(method, params).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Run `hook` once when this connection is torn down (immediately if it
    /// already has been).
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.connection.on_close(hook);
    }

    /// Close this connection. Teardown completes on the session task.
    pub fn close(&self) {
        self.connection
            .request_close(DisconnectReason::ClosedByServer);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", self.connection.id())
            .field("state", &self.connection.state())
            .finish_non_exhaustive()
    }
}
