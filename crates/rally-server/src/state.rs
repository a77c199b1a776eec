//! Shared server state: live connections, topics, presence, and the
//! function/listener registries every connection dispatches through.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use rally_core::{Codec, ConnectionId, Frame, Identity, Outbox};
use rally_rpc::{ListenerRegistry, MethodRegistry};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::context::Context;
use crate::groups::GroupRegistry;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::presence::{PresenceChange, PresenceTracker};
use crate::websocket::connection::{Connection, DisconnectReason};

/// State owned by one server instance.
pub struct ServerState {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    groups: GroupRegistry<Arc<Connection>>,
    presence: PresenceTracker,
    methods: Arc<MethodRegistry<Context>>,
    listeners: Arc<ListenerRegistry<Context>>,
    codec: Arc<dyn Codec>,
}

impl ServerState {
    /// Create empty state using `codec` for every connection.
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            groups: GroupRegistry::new(codec.clone()),
            presence: PresenceTracker::new(),
            methods: Arc::new(MethodRegistry::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            codec,
        }
    }

    /// Functions callable by clients.
    pub fn methods(&self) -> &Arc<MethodRegistry<Context>> {
        &self.methods
    }

    /// Listeners for client events.
    pub fn listeners(&self) -> &Arc<ListenerRegistry<Context>> {
        &self.listeners
    }

    /// Topic registry.
    pub fn groups(&self) -> &GroupRegistry<Arc<Connection>> {
        &self.groups
    }

    /// Presence tracker.
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Codec used for every connection.
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Register a new connection and move it to `Open`.
    ///
    /// Returns the connection and the receiver its writer task drains.
    pub fn open(&self, queue_capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (outbox, rx) = Outbox::new(queue_capacity, self.codec.clone());
        let connection = Arc::new(Connection::new(
            outbox,
            self.methods.clone(),
            self.listeners.clone(),
        ));
        let _ = self
            .connections
            .write()
            .insert(connection.id().clone(), connection.clone());
        connection.mark_open();

        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        info!(conn_id = %connection.id(), "client connected");
        (connection, rx)
    }

    /// Handler context for `connection`.
    pub fn context(self: &Arc<Self>, connection: &Arc<Connection>) -> Context {
        Context::new(connection.clone(), self.clone())
    }

    /// Look up a live connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Record `identity` on `connection` and update presence.
    ///
    /// Re-authenticating as the same user leaves presence untouched; as a
    /// different user it moves the connection's presence hold. Returns
    /// `false` if the connection is no longer open.
    ///
    /// Counters change under the connection's lifecycle lock so teardown
    /// cannot interleave; presence listeners run after it is released.
    pub fn authenticate(&self, connection: &Connection, identity: Identity) -> bool {
        let changes = connection.with_open(|| {
            let user_id = identity.user_id.clone();
            let mut changes = Vec::with_capacity(2);
            match connection.replace_identity(identity) {
                Some(previous) if previous.user_id == user_id => {}
                previous => {
                    if let Some(previous) = previous {
                        changes.extend(self.record_release(connection.id(), &previous.user_id));
                    }
                    changes.push(self.presence.record_connected(&user_id));
                }
            }
            changes
        });
        let Some(changes) = changes else {
            return false;
        };
        for change in changes {
            change.notify();
        }
        true
    }

    /// Add `connection` to `topic`. Returns `false` if it was already a
    /// member or is no longer open.
    pub fn join(&self, connection: &Arc<Connection>, topic: &str) -> bool {
        connection
            .with_open(|| self.groups.join(connection, topic))
            .unwrap_or(false)
    }

    /// Send an `Event` to every member of `topic`.
    pub fn broadcast(&self, topic: &str, method: &str, params: Vec<Value>) -> usize {
        self.groups.broadcast(topic, method, params)
    }

    /// Invoke `f` with the context of every member of `topic`.
    pub fn for_each_member(self: &Arc<Self>, topic: &str, mut f: impl FnMut(Context)) {
        self.groups
            .for_each_member(topic, |member| f(self.context(member)));
    }

    /// Tear `connection` down. Runs at most once per connection; later calls
    /// return `false`.
    ///
    /// Order: leave every topic, release presence, run close hooks, close
    /// the transport, fail pending outbound calls.
    pub fn disconnect(&self, connection: &Connection, reason: DisconnectReason) -> bool {
        if !connection.begin_close() {
            return false;
        }
        let id = connection.id();
        let _ = self.connections.write().remove(id);

        let topics = self.groups.leave_all(id);
        let identity = connection.take_identity();
        if let Some(identity) = &identity {
            self.release_presence(id, &identity.user_id);
        }
        let _ = connection.run_close_hooks();
        connection.request_close(reason);
        let lost_calls = connection.peer().detach();
        connection.finish_close();

        counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
        info!(
            conn_id = %id,
            reason = reason.as_str(),
            user_id = identity.as_ref().map(|i| i.user_id.as_str()),
            topics = topics.len(),
            lost_calls,
            dropped_frames = connection.drop_count(),
            "client disconnected"
        );
        true
    }

    /// Ask every live connection to close; sessions finish the teardown.
    pub fn close_all(&self, reason: DisconnectReason) -> usize {
        let connections = self.connections();
        for connection in &connections {
            connection.request_close(reason);
        }
        connections.len()
    }

    fn release_presence(&self, id: &ConnectionId, user_id: &str) {
        if let Some(change) = self.record_release(id, user_id) {
            change.notify();
        }
    }

    fn record_release(&self, id: &ConnectionId, user_id: &str) -> Option<PresenceChange> {
        match self.presence.record_disconnected(user_id) {
            Ok(change) => Some(change),
            Err(e) => {
                error!(conn_id = %id, user_id, error = %e, "presence released more than held");
                None
            }
        }
    }
}
