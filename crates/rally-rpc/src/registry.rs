//! Method registry and async dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use rally_core::Message;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{HandlerError, UNKNOWN_ERROR};
use crate::handler::{MethodHandler, handler_fn};
use crate::metrics::{RPC_CALL_DURATION_SECONDS, RPC_CALLS_TOTAL, RPC_ERRORS_TOTAL};

/// Calls slower than this are logged at `warn`.
const SLOW_CALL_THRESHOLD: Duration = Duration::from_secs(5);

/// Registry mapping function names to handlers.
///
/// Registration takes `&self` so functions can be added or replaced while
/// connections are live; re-registering a name silently replaces the
/// previous handler.
pub struct MethodRegistry<C> {
    handlers: RwLock<HashMap<String, Arc<dyn MethodHandler<C>>>>,
}

impl<C> MethodRegistry<C>
where
    C: Send + 'static,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a handler for a function name.
    pub fn register(&self, method: &str, handler: impl MethodHandler<C> + 'static) {
        let _ = self
            .handlers
            .write()
            .insert(method.to_owned(), Arc::new(handler));
    }

    /// Register (or replace) an async closure as a handler.
    pub fn register_fn<F, Fut>(&self, method: &str, f: F)
    where
        F: Fn(C, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(method, handler_fn(f));
    }

    /// Remove a handler. Returns `true` if one was registered.
    pub fn unregister(&self, method: &str) -> bool {
        self.handlers.write().remove(method).is_some()
    }

    /// Check whether a function is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.read().contains_key(method)
    }

    /// List all registered function names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke the function named `method` and build the `Response` for call `id`.
    ///
    /// Never fails: a missing function, a handler error, and a handler panic
    /// all become error responses.
    pub async fn dispatch(&self, ctx: C, id: u32, method: &str, params: Vec<Value>) -> Message {
        counter!(RPC_CALLS_TOTAL, "method" => method.to_owned()).increment(1);

        // Clone the handler out so the lock is not held across the await.
        let handler = self.handlers.read().get(method).cloned();
        let Some(handler) = handler else {
            counter!(RPC_ERRORS_TOTAL, "method" => method.to_owned()).increment(1);
            warn!(method, id, "unknown method");
            let err = HandlerError::MethodNotFound {
                method: method.to_owned(),
            };
            return Message::failure(id, err.wire_message());
        };

        let start = Instant::now();
        let outcome = AssertUnwindSafe(handler.handle(ctx, params))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(Ok(result)) => Message::success(id, result),
            Ok(Err(err)) => {
                counter!(RPC_ERRORS_TOTAL, "method" => method.to_owned()).increment(1);
                debug!(method, id, error = %err, "handler returned error");
                Message::failure(id, err.wire_message())
            }
            Err(panic) => {
                counter!(RPC_ERRORS_TOTAL, "method" => method.to_owned()).increment(1);
                let message = panic_message(panic.as_ref());
                warn!(method, id, panic = %message, "handler panicked");
                Message::failure(id, message)
            }
        };

        let duration = start.elapsed();
        histogram!(RPC_CALL_DURATION_SECONDS, "method" => method.to_owned())
            .record(duration.as_secs_f64());
        if duration >= SLOW_CALL_THRESHOLD {
            warn!(
                method,
                duration_secs = duration.as_secs_f64(),
                "slow RPC call"
            );
        }

        response
    }
}

impl<C> Default for MethodRegistry<C>
where
    C: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN_ERROR.to_owned())
}
