//! Method handler trait and closure adapter.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::HandlerError;

/// A function the remote peer may invoke by name.
///
/// `C` is the per-connection context handed to every invocation (the
/// server's connection context, or the client itself).
#[async_trait]
pub trait MethodHandler<C>: Send + Sync {
    /// Execute the function with the caller's context and positional params.
    async fn handle(&self, ctx: C, params: Vec<Value>) -> Result<Value, HandlerError>;
}

/// [`MethodHandler`] backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure `|ctx, params| async move { ... }` as a handler.
pub fn handler_fn<C, F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(C, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<C, F, Fut> MethodHandler<C> for FnHandler<F>
where
    C: Send + 'static,
    F: Fn(C, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: C, params: Vec<Value>) -> Result<Value, HandlerError> {
        (self.f)(ctx, params).await
    }
}
