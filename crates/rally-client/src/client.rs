//! The client role.
//!
//! A [`RallyClient`] owns one [`RpcPeer`] for its whole life. Each successful
//! [`RallyClient::connect`] attaches a fresh transport to that peer, so
//! registered functions, listeners, and the call id sequence survive a
//! reconnect while in-flight calls fail with `ConnectionLost`.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rally_core::{Codec, Frame, JsonCodec, Message, Outbox};
use rally_rpc::{
    CallError, HandlerError, Inbound, ListenerId, ListenerRegistry, MethodHandler,
    MethodRegistry, RpcPeer,
};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::errors::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECONNECTED: &str = "reconnected";
const DISCONNECTED: &str = "disconnected";

#[derive(Debug, Default)]
struct Link {
    /// Bumped on every connect; a transport task only tears down its own
    /// generation.
    generation: u64,
    open: bool,
    has_opened: bool,
}

struct Inner {
    config: ClientConfig,
    codec: Arc<dyn Codec>,
    peer: RpcPeer<RallyClient>,
    lifecycle: ListenerRegistry<RallyClient>,
    link: Mutex<Link>,
}

/// Client end of a Rally connection. Cheap to clone; clones share the
/// transport.
///
/// Functions registered with [`RallyClient::register_fn`] and listeners
/// added with [`RallyClient::on`] receive a clone of the client as their
/// context.
#[derive(Clone)]
pub struct RallyClient {
    inner: Arc<Inner>,
}

impl RallyClient {
    /// Create a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_codec(config, Arc::new(JsonCodec))
    }

    /// Create a disconnected client using `codec` for frames.
    pub fn with_codec(config: ClientConfig, codec: Arc<dyn Codec>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                codec,
                peer: RpcPeer::new(
                    Arc::new(MethodRegistry::new()),
                    Arc::new(ListenerRegistry::new()),
                ),
                lifecycle: ListenerRegistry::new(),
                link: Mutex::new(Link::default()),
            }),
        }
    }

    /// Create a client for `url` and connect it.
    pub async fn connect_to(url: impl Into<String>) -> Result<Self, ClientError> {
        let client = Self::new(ClientConfig::new(url));
        client.connect().await?;
        Ok(client)
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Whether a transport is open.
    pub fn is_open(&self) -> bool {
        self.inner.link.lock().open
    }

    /// Outstanding calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.peer.pending().len()
    }

    // ── Transport ───────────────────────────────────────────────────────

    /// Open a transport to the configured URL.
    ///
    /// Fires the `reconnected` hooks if this client has been open before.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.is_open() {
            return Err(ClientError::AlreadyConnected);
        }
        let url = self.inner.config.url.clone();
        let (ws, _response) =
            match tokio::time::timeout(self.inner.config.connect_timeout(), connect_async(&url))
                .await
            {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => {
                    return Err(ClientError::Connect {
                        url,
                        source: Box::new(e),
                    });
                }
                Err(_) => return Err(ClientError::Timeout { url }),
            };

        let (ws_tx, ws_rx) = ws.split();
        let (outbox, send_rx) =
            Outbox::new(self.inner.config.send_queue_capacity, self.inner.codec.clone());
        let closed = outbox.close_token();

        let (generation, reconnected) = {
            let mut link = self.inner.link.lock();
            if link.open {
                // Lost a race with a concurrent connect.
                return Err(ClientError::AlreadyConnected);
            }
            link.generation += 1;
            link.open = true;
            let reconnected = link.has_opened;
            link.has_opened = true;
            (link.generation, reconnected)
        };
        self.inner.peer.attach(outbox.clone());

        let _ = tokio::spawn(write_loop(ws_tx, send_rx, closed.clone()));
        let _ = tokio::spawn(read_loop(self.clone(), ws_rx, outbox, closed, generation));

        info!(url = %url, generation, "connected");
        if reconnected {
            let _ = self.inner.lifecycle.emit(self, RECONNECTED, &[]);
        }
        Ok(())
    }

    /// Drop the current transport and open a new one.
    ///
    /// Calls still in flight on the old transport fail with
    /// [`CallError::ConnectionLost`].
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.close();
        self.connect().await
    }

    /// Close the current transport. A no-op if none is open.
    pub fn close(&self) {
        let generation = self.inner.link.lock().generation;
        self.transport_lost(generation);
    }

    fn transport_lost(&self, generation: u64) {
        {
            let mut link = self.inner.link.lock();
            if link.generation != generation || !link.open {
                return;
            }
            link.open = false;
        }
        let lost = self.inner.peer.detach();
        info!(generation, lost_calls = lost, "disconnected");
        let _ = self.inner.lifecycle.emit(self, DISCONNECTED, &[]);
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Call a server function and wait for its result.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        self.inner.peer.call(method, params).await
    }

    /// Send a fire-and-forget event. Returns whether it was queued.
    pub fn emit(&self, method: &str, params: Vec<Value>) -> bool {
        self.inner.peer.emit(method, params)
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Expose `handler` to the server under `method`.
    pub fn register(&self, method: &str, handler: impl MethodHandler<RallyClient> + 'static) {
        self.inner.peer.methods().register(method, handler);
    }

    /// Expose an async closure to the server under `method`.
    pub fn register_fn<F, Fut>(&self, method: &str, f: F)
    where
        F: Fn(RallyClient, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.inner.peer.methods().register_fn(method, f);
    }

    /// Listen for server events named `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(RallyClient, Vec<Value>) + Send + Sync + 'static,
    {
        self.inner.peer.listeners().on(event, listener)
    }

    /// Remove a listener added with [`RallyClient::on`].
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.peer.listeners().off(event, id)
    }

    /// Run `hook` after every successful connect except the first.
    pub fn on_reconnected<F>(&self, hook: F) -> ListenerId
    where
        F: Fn(RallyClient) + Send + Sync + 'static,
    {
        self.inner
            .lifecycle
            .on(RECONNECTED, move |client, _| hook(client))
    }

    /// Run `hook` whenever an open transport is lost or closed.
    pub fn on_disconnected<F>(&self, hook: F) -> ListenerId
    where
        F: Fn(RallyClient) + Send + Sync + 'static,
    {
        self.inner
            .lifecycle
            .on(DISCONNECTED, move |client, _| hook(client))
    }
}

impl std::fmt::Debug for RallyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RallyClient")
            .field("url", &self.inner.config.url)
            .field("link", &*self.inner.link.lock())
            .finish_non_exhaustive()
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WsStream, WsMessage>,
    mut send_rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            frame = send_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = ws_tx.send(WsMessage::Text(String::clone(&frame).into())).await {
                    debug!(error = %e, "write failed");
                    break;
                }
            }
            () = closed.cancelled() => break,
        }
    }
    // Wakes the read loop if the socket failed first.
    closed.cancel();
    let _ = ws_tx.close().await;
}

async fn read_loop(
    client: RallyClient,
    mut ws_rx: SplitStream<WsStream>,
    outbox: Outbox,
    closed: CancellationToken,
    generation: u64,
) {
    let codec = client.inner.codec.clone();
    loop {
        let frame = tokio::select! {
            () = closed.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let decoded = match frame {
            Some(Ok(WsMessage::Text(text))) => codec.decode(text.as_bytes()),
            Some(Ok(WsMessage::Binary(data))) => codec.decode(&data),
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!(generation, "server closed the connection");
                break;
            }
            Some(Err(e)) => {
                debug!(generation, error = %e, "transport error");
                break;
            }
        };
        match decoded {
            Ok(message) => {
                trace!(kind = message.kind(), "inbound message");
                if client.inner.peer.handle_inbound(client.clone(), message) == Inbound::Ping {
                    let _ = outbox.send(&Message::Ping);
                }
            }
            Err(e) => {
                warn!(error = %e, "undecodable frame, closing connection");
                break;
            }
        }
    }
    client.transport_lost(generation);
}
