//! WebSocket session lifecycle: one connected client from upgrade through
//! teardown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use rally_rpc::Inbound;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::connection::DisconnectReason;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::metrics::HEARTBEAT_TIMEOUTS_TOTAL;
use crate::state::ServerState;

/// Per-session settings taken from the server config.
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Heartbeat probe interval.
    pub heartbeat_interval: Duration,
    /// Outbound queue capacity in frames.
    pub send_queue_capacity: usize,
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection and moves it to `Open`
/// 2. Forwards queued outbound frames to the socket on a writer task
/// 3. Runs the heartbeat on its own task
/// 4. Decodes inbound frames and routes them through the correlation engine;
///    an undecodable frame closes the connection
/// 5. Tears down once on close, transport error, heartbeat timeout, server
///    close, or shutdown
#[instrument(skip_all, fields(conn_id = tracing::field::Empty))]
pub async fn run_ws_session(
    ws: WebSocket,
    state: Arc<ServerState>,
    options: SessionOptions,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (connection, mut send_rx) = state.open(options.send_queue_capacity);
    let _ = tracing::Span::current().record("conn_id", connection.id().as_str());
    let ctx = state.context(&connection);
    let codec = state.codec().clone();
    let closed = connection.outbox().close_token();

    // Outbound forwarder; stops when the outbox closes.
    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = send_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(WsMessage::Text(String::clone(&frame).into())).await.is_err() {
                        break;
                    }
                }
                () = writer_closed.cancelled() => break,
            }
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
        let _ = ws_tx.close().await;
    });

    let hb_connection = connection.clone();
    let hb_cancel = closed.clone();
    let heartbeat = tokio::spawn(async move {
        let result = run_heartbeat(hb_connection.clone(), options.heartbeat_interval, hb_cancel).await;
        if result == HeartbeatResult::TimedOut {
            warn!(conn_id = %hb_connection.id(), "heartbeat timed out, closing");
            counter!(HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
            hb_connection.request_close(DisconnectReason::HeartbeatTimeout);
        }
    });

    let reason = loop {
        let frame = tokio::select! {
            () = closed.cancelled() => {
                break connection.close_reason().unwrap_or(DisconnectReason::ClosedByServer);
            }
            () = shutdown.cancelled() => break DisconnectReason::Shutdown,
            frame = ws_rx.next() => frame,
        };

        let decoded = match frame {
            Some(Ok(WsMessage::Text(text))) => codec.decode(text.as_str().as_bytes()),
            Some(Ok(WsMessage::Binary(data))) => codec.decode(&data),
            // Transport-level ping/pong is answered by axum; liveness uses
            // protocol pings only.
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            Some(Ok(WsMessage::Close(_))) | None => break DisconnectReason::ClientClosed,
            Some(Err(e)) => {
                debug!(error = %e, "transport error");
                break DisconnectReason::TransportError;
            }
        };

        match decoded {
            Ok(message) => {
                trace!(kind = message.kind(), "inbound message");
                if connection.peer().handle_inbound(ctx.clone(), message) == Inbound::Ping {
                    connection.mark_pong();
                }
            }
            Err(e) => {
                warn!(error = %e, "undecodable frame, closing connection");
                break DisconnectReason::DecodeFailure;
            }
        }
    };

    let _ = state.disconnect(&connection, reason);
    heartbeat.abort();
    let _ = writer.await;
}
