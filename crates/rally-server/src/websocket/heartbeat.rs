//! Server-initiated heartbeat.
//!
//! Each cycle sends a protocol `Ping`, waits one interval, then checks that
//! the peer answered with a `Ping` of its own since the probe went out. A
//! silent peer is therefore detected within two intervals of its last reply.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::connection::Connection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer did not answer a probe within one interval.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Run probe cycles for `connection` until it times out or `cancel` fires.
pub async fn run_heartbeat(
    connection: Arc<Connection>,
    interval: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    loop {
        if !connection.send_ping() {
            trace!(conn_id = %connection.id(), "ping not queued");
        }
        tokio::select! {
            () = time::sleep(interval) => {}
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
        if !connection.pong_since_last_ping() {
            return HeartbeatResult::TimedOut;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rally_core::{Frame, JsonCodec, Outbox};
    use rally_rpc::{ListenerRegistry, MethodRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn make_connection() -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (outbox, rx) = Outbox::new(32, Arc::new(JsonCodec));
        let conn = Connection::new(
            outbox,
            Arc::new(MethodRegistry::new()),
            Arc::new(ListenerRegistry::new()),
        );
        conn.mark_open();
        (Arc::new(conn), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_after_one_interval() {
        let (conn, mut rx) = make_connection();
        let start = time::Instant::now();

        let result = run_heartbeat(conn, Duration::from_secs(30), CancellationToken::new()).await;

        assert_eq!(result, HeartbeatResult::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(rx.recv().await.unwrap().as_str(), r#"{"kind":"ping"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn answering_peer_stays_alive() {
        let (conn, mut rx) = make_connection();
        let cancel = CancellationToken::new();
        let answered = Arc::new(AtomicUsize::new(0));

        let responder = conn.clone();
        let count = answered.clone();
        let _pongs = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                responder.mark_pong();
                let _ = count.fetch_add(1, Ordering::Relaxed);
            }
        });

        let heartbeat = tokio::spawn(run_heartbeat(
            conn,
            Duration::from_millis(100),
            cancel.clone(),
        ));

        time::sleep(Duration::from_millis(550)).await;
        assert!(!heartbeat.is_finished());
        cancel.cancel();
        assert_eq!(heartbeat.await.unwrap(), HeartbeatResult::Cancelled);
        // Five full cycles plus the probe sent at the start of the sixth.
        assert_eq!(answered.load(Ordering::Relaxed), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_that_stops_answering_is_detected() {
        let (conn, mut rx) = make_connection();
        let responder = conn.clone();
        let _pongs = tokio::spawn(async move {
            for _ in 0..3 {
                let _ = rx.recv().await;
                responder.mark_pong();
            }
            // Keep the queue open but stop answering.
            while rx.recv().await.is_some() {}
        });

        let start = time::Instant::now();
        let result =
            run_heartbeat(conn, Duration::from_millis(100), CancellationToken::new()).await;
        assert_eq!(result, HeartbeatResult::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn cancel_stops_immediately() {
        let (conn, _rx) = make_connection();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_heartbeat(conn, Duration::from_secs(60), cancel).await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }
}
