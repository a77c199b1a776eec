//! Per-connection correlation engine.
//!
//! An [`RpcPeer`] is used identically by both roles. It owns the pending-call
//! table for one logical connection and shares the function and listener
//! registries with every other connection of the same server or client.

use std::sync::Arc;

use parking_lot::RwLock;
use rally_core::{Message, Outbox};
use serde_json::Value;
use tracing::{debug, trace};

use crate::errors::CallError;
use crate::listeners::ListenerRegistry;
use crate::pending::PendingCalls;
use crate::registry::MethodRegistry;

/// What the transport loop must do after [`RpcPeer::handle_inbound`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// The message was a call, response, or event and has been routed.
    Routed,
    /// The message was a liveness `Ping`; the role decides how to answer.
    Ping,
}

/// One connection's view of the RPC engine.
pub struct RpcPeer<C> {
    methods: Arc<MethodRegistry<C>>,
    listeners: Arc<ListenerRegistry<C>>,
    pending: PendingCalls,
    outbox: RwLock<Option<Outbox>>,
}

impl<C> RpcPeer<C>
where
    C: Clone + Send + 'static,
{
    /// Create a peer with no transport attached.
    pub fn new(methods: Arc<MethodRegistry<C>>, listeners: Arc<ListenerRegistry<C>>) -> Self {
        Self {
            methods,
            listeners,
            pending: PendingCalls::new(),
            outbox: RwLock::new(None),
        }
    }

    /// Attach a transport; outbound messages are queued on `outbox`.
    pub fn attach(&self, outbox: Outbox) {
        if let Some(previous) = self.outbox.write().replace(outbox) {
            previous.close();
        }
    }

    /// Detach and close the current transport, failing every pending call.
    ///
    /// Returns the number of calls that were outstanding.
    pub fn detach(&self) -> usize {
        if let Some(outbox) = self.outbox.write().take() {
            outbox.close();
        }
        let lost = self.pending.fail_all();
        if lost > 0 {
            debug!(lost, "pending calls failed on detach");
        }
        lost
    }

    /// The currently attached transport, if any.
    pub fn outbox(&self) -> Option<Outbox> {
        self.outbox.read().clone()
    }

    /// Whether a transport is attached and still open.
    pub fn is_attached(&self) -> bool {
        self.outbox.read().as_ref().is_some_and(|o| !o.is_closed())
    }

    /// Outstanding outbound calls.
    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Shared function registry.
    pub fn methods(&self) -> &Arc<MethodRegistry<C>> {
        &self.methods
    }

    /// Shared event listener registry.
    pub fn listeners(&self) -> &Arc<ListenerRegistry<C>> {
        &self.listeners
    }

    /// Call a function on the remote peer and wait for its response.
    ///
    /// There is no per-call timeout: the future settles when the response
    /// arrives or the transport is detached.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        let outbox = self.outbox().ok_or(CallError::NotConnected)?;
        let (id, rx) = self.pending.register()?;
        trace!(id, method, "sending call");
        if !outbox.send(&Message::call(id, method, params)) {
            let _ = self.pending.cancel(id);
            return Err(CallError::ConnectionLost);
        }
        rx.await.unwrap_or(Err(CallError::ConnectionLost))
    }

    /// Send a fire-and-forget event to the remote peer.
    ///
    /// Returns whether the frame was queued; failures are otherwise silent and
    /// surface only through the transport's close path.
    pub fn emit(&self, method: &str, params: Vec<Value>) -> bool {
        self.outbox()
            .is_some_and(|outbox| outbox.send(&Message::event(method, params)))
    }

    /// Route one decoded inbound message.
    ///
    /// Calls run on their own task so a suspended handler never blocks the
    /// read loop; overlapping calls may therefore be answered out of order.
    /// The response goes to the transport that delivered the call.
    pub fn handle_inbound(&self, ctx: C, message: Message) -> Inbound {
        match message {
            Message::Call { id, method, params } => {
                let methods = self.methods.clone();
                let reply_to = self.outbox();
                let _ = tokio::spawn(async move {
                    let response = methods.dispatch(ctx, id, &method, params).await;
                    let delivered = reply_to.is_some_and(|outbox| outbox.send(&response));
                    if !delivered {
                        debug!(id, method, "response dropped, transport gone");
                    }
                });
                Inbound::Routed
            }
            Message::Response {
                id,
                result,
                is_error,
            } => {
                if !self.pending.resolve(id, result, is_error) {
                    debug!(id, "discarding response for unknown call");
                }
                Inbound::Routed
            }
            Message::Event { method, params } => {
                let _ = self.listeners.emit(&ctx, &method, &params);
                Inbound::Routed
            }
            Message::Ping => Inbound::Ping,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use rally_core::{Frame, JsonCodec};
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::errors::HandlerError;

    fn make_peer() -> (Arc<RpcPeer<()>>, mpsc::Receiver<Frame>) {
        let peer = Arc::new(RpcPeer::new(
            Arc::new(MethodRegistry::new()),
            Arc::new(ListenerRegistry::new()),
        ));
        let (outbox, rx) = Outbox::new(32, Arc::new(JsonCodec));
        peer.attach(outbox);
        (peer, rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<Frame>) -> Message {
        let frame = rx.recv().await.unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn call_resolves_with_matching_response() {
        let (peer, mut rx) = make_peer();
        let caller = peer.clone();
        let call = tokio::spawn(async move { caller.call("echo", vec![json!("hello")]).await });

        let sent = next_message(&mut rx).await;
        assert_eq!(sent, Message::call(0, "echo", vec![json!("hello")]));

        let routed = peer.handle_inbound((), Message::success(0, json!("hello")));
        assert_eq!(routed, Inbound::Routed);
        assert_eq!(call.await.unwrap(), Ok(json!("hello")));
    }

    #[tokio::test]
    async fn call_rejects_with_remote_error() {
        let (peer, mut rx) = make_peer();
        let caller = peer.clone();
        let call = tokio::spawn(async move { caller.call("nope", vec![]).await });
        let _ = next_message(&mut rx).await;

        let _ = peer.handle_inbound((), Message::failure(0, "Method 'nope' not found"));
        assert_matches!(
            call.await.unwrap(),
            Err(CallError::Remote { message }) if message == "Method 'nope' not found"
        );
    }

    #[tokio::test]
    async fn call_ids_strictly_increase() {
        let (peer, mut rx) = make_peer();
        for _ in 0..3 {
            let caller = peer.clone();
            let _ = tokio::spawn(async move { caller.call("m", vec![]).await });
        }
        let mut ids = Vec::new();
        for _ in 0..3 {
            if let Message::Call { id, .. } = next_message(&mut rx).await {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(peer.pending().len(), 3);
    }

    #[tokio::test]
    async fn detach_fails_pending_calls() {
        let (peer, mut rx) = make_peer();
        let caller = peer.clone();
        let call = tokio::spawn(async move { caller.call("hang", vec![]).await });
        let _ = next_message(&mut rx).await;

        assert_eq!(peer.detach(), 1);
        assert_eq!(call.await.unwrap(), Err(CallError::ConnectionLost));
        assert!(!peer.is_attached());
    }

    #[tokio::test]
    async fn call_without_transport_fails() {
        let peer: RpcPeer<()> =
            RpcPeer::new(Arc::new(MethodRegistry::new()), Arc::new(ListenerRegistry::new()));
        assert_eq!(peer.call("x", vec![]).await, Err(CallError::NotConnected));
    }

    #[tokio::test]
    async fn call_on_closed_transport_fails_fast() {
        let (peer, _rx) = make_peer();
        if let Some(outbox) = peer.outbox() {
            outbox.close();
        }
        assert_eq!(peer.call("x", vec![]).await, Err(CallError::ConnectionLost));
        assert!(peer.pending().is_empty());
    }

    #[tokio::test]
    async fn inbound_call_is_answered() {
        let (peer, mut rx) = make_peer();
        peer.methods().register_fn("echo", |(), params| async move {
            Ok(params.into_iter().next().unwrap_or(Value::Null))
        });
        let _ = peer.handle_inbound((), Message::call(7, "echo", vec![json!("hi")]));
        assert_eq!(next_message(&mut rx).await, Message::success(7, json!("hi")));
    }

    #[tokio::test]
    async fn inbound_call_to_unknown_method() {
        let (peer, mut rx) = make_peer();
        let _ = peer.handle_inbound((), Message::call(1, "missing", vec![]));
        assert_eq!(
            next_message(&mut rx).await,
            Message::failure(1, "Method 'missing' not found")
        );
    }

    #[tokio::test]
    async fn inbound_call_handler_error() {
        let (peer, mut rx) = make_peer();
        peer.methods()
            .register_fn("fail", |(), _| async { Err(HandlerError::NotAuthorized) });
        let _ = peer.handle_inbound((), Message::call(2, "fail", vec![]));
        assert_eq!(next_message(&mut rx).await, Message::failure(2, "Not authorized"));
    }

    #[tokio::test]
    async fn inbound_event_reaches_listener() {
        let (peer, _rx) = make_peer();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _ = peer.listeners().on("onMessage", move |(), params| sink.lock().push(params));
        let _ = peer.handle_inbound(
            (),
            Message::event("onMessage", vec![json!("room1"), json!("Hello world")]),
        );
        assert_eq!(
            *seen.lock(),
            vec![vec![json!("room1"), json!("Hello world")]]
        );
    }

    #[tokio::test]
    async fn stale_response_is_ignored() {
        let (peer, _rx) = make_peer();
        assert_eq!(
            peer.handle_inbound((), Message::success(42, json!(null))),
            Inbound::Routed
        );
    }

    #[tokio::test]
    async fn ping_is_reported() {
        let (peer, _rx) = make_peer();
        assert_eq!(peer.handle_inbound((), Message::Ping), Inbound::Ping);
    }

    #[tokio::test]
    async fn emit_sends_event() {
        let (peer, mut rx) = make_peer();
        assert!(peer.emit("tick", vec![json!(1)]));
        assert_eq!(next_message(&mut rx).await, Message::event("tick", vec![json!(1)]));
    }

    #[tokio::test]
    async fn emit_without_transport_is_silent() {
        let (peer, _rx) = make_peer();
        let _ = peer.detach();
        assert!(!peer.emit("tick", vec![]));
    }

    #[tokio::test]
    async fn attach_replaces_and_closes_previous() {
        let (peer, _rx) = make_peer();
        let old = peer.outbox().unwrap();
        let (fresh, _rx2) = Outbox::new(4, Arc::new(JsonCodec));
        peer.attach(fresh);
        assert!(old.is_closed());
        assert!(peer.is_attached());
    }
}
