//! Outbound call bookkeeping: id allocation and response matching.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::errors::CallError;

type Reply = Result<Value, CallError>;

struct PendingState {
    /// Next id to hand out; `None` once the id space is spent.
    next_id: Option<u32>,
    calls: HashMap<u32, oneshot::Sender<Reply>>,
}

/// In-flight calls for one connection.
///
/// Ids start at 0, increase by one per call, and are never reused.
pub struct PendingCalls {
    state: Mutex<PendingState>,
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingState {
                next_id: Some(0),
                calls: HashMap::new(),
            }),
        }
    }

    /// Allocate the next id and a receiver that settles when it is answered.
    pub fn register(&self) -> Result<(u32, oneshot::Receiver<Reply>), CallError> {
        let mut state = self.state.lock();
        let id = state.next_id.ok_or(CallError::IdsExhausted)?;
        state.next_id = id.checked_add(1);
        let (tx, rx) = oneshot::channel();
        let _ = state.calls.insert(id, tx);
        Ok((id, rx))
    }

    /// Settle call `id` with a response.
    ///
    /// Returns `false` if no call with that id is pending (stale or unknown).
    pub fn resolve(&self, id: u32, result: Value, is_error: bool) -> bool {
        let Some(tx) = self.state.lock().calls.remove(&id) else {
            return false;
        };
        let reply = if is_error {
            Err(CallError::from_result(&result))
        } else {
            Ok(result)
        };
        // The caller may have stopped waiting; that is not an error.
        let _ = tx.send(reply);
        true
    }

    /// Forget call `id` without settling it.
    pub fn cancel(&self, id: u32) -> bool {
        self.state.lock().calls.remove(&id).is_some()
    }

    /// Drop every pending call; their receivers observe [`CallError::ConnectionLost`].
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.state.lock().calls.drain().collect();
        drained.len()
    }

    /// Number of calls awaiting a response.
    pub fn len(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Whether no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn ids_start_at_zero_and_increase() {
        let pending = PendingCalls::new();
        let ids: Vec<u32> = (0..4).map(|_| pending.register().unwrap().0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn ids_not_reused_after_resolution() {
        let pending = PendingCalls::new();
        let (first, _rx) = pending.register().unwrap();
        assert!(pending.resolve(first, json!(1), false));
        let (second, _rx2) = pending.register().unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn resolve_success() {
        let pending = PendingCalls::new();
        let (id, rx) = pending.register().unwrap();
        assert!(pending.resolve(id, json!("hello"), false));
        assert_eq!(rx.await.unwrap(), Ok(json!("hello")));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn resolve_error_is_remote() {
        let pending = PendingCalls::new();
        let (id, rx) = pending.register().unwrap();
        assert!(pending.resolve(id, json!("Method 'x' not found"), true));
        assert_matches!(rx.await.unwrap(), Err(CallError::Remote { message }) if message == "Method 'x' not found");
    }

    #[test]
    fn unknown_id_is_discarded() {
        let pending = PendingCalls::new();
        assert!(!pending.resolve(99, json!(null), false));
    }

    #[test]
    fn duplicate_response_is_discarded() {
        let pending = PendingCalls::new();
        let (id, _rx) = pending.register().unwrap();
        assert!(pending.resolve(id, json!(1), false));
        assert!(!pending.resolve(id, json!(2), false));
    }

    #[tokio::test]
    async fn fail_all_drops_senders() {
        let pending = PendingCalls::new();
        let (_a, rx_a) = pending.register().unwrap();
        let (_b, rx_b) = pending.register().unwrap();
        assert_eq!(pending.fail_all(), 2);
        assert!(rx_a.await.is_err());
        assert!(rx_b.await.is_err());
        assert!(pending.is_empty());
    }

    #[test]
    fn cancel_removes_entry() {
        let pending = PendingCalls::new();
        let (id, _rx) = pending.register().unwrap();
        assert!(pending.cancel(id));
        assert!(!pending.cancel(id));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn exhausted_id_space_fails() {
        let pending = PendingCalls::new();
        pending.state.lock().next_id = Some(u32::MAX);
        let (last, _rx) = pending.register().unwrap();
        assert_eq!(last, u32::MAX);
        assert_matches!(pending.register(), Err(CallError::IdsExhausted));
    }
}
