//! Token verification and the built-in `auth` function.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rally_core::Identity;
use rally_rpc::params::arg;
use rally_rpc::{HandlerError, MethodHandler};
use serde_json::Value;
use tracing::{debug, info};

use crate::context::Context;

/// Name of the built-in authentication function.
pub const AUTH_METHOD: &str = "auth";

/// Resolves a client-supplied token to an identity.
#[async_trait]
pub trait AuthVerifier: Send + Sync + 'static {
    /// Return the identity for `token`, or `None` to reject it.
    async fn verify(&self, token: &str) -> Option<Identity>;
}

/// Verifier backed by a fixed token table.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    /// Create an empty verifier that rejects every token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `identity`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        let _ = self.tokens.insert(token.into(), identity);
        self
    }

    /// Number of accepted tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token is accepted.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl AuthVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

/// Adapter turning an async closure into an [`AuthVerifier`].
pub struct FnVerifier<F>(F);

/// Wrap an async closure `token -> Option<Identity>` as a verifier.
pub fn verifier_fn<F, Fut>(f: F) -> FnVerifier<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Identity>> + Send + 'static,
{
    FnVerifier(f)
}

#[async_trait]
impl<F, Fut> AuthVerifier for FnVerifier<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Identity>> + Send + 'static,
{
    async fn verify(&self, token: &str) -> Option<Identity> {
        (self.0)(token.to_owned()).await
    }
}

/// Handler for the built-in `auth(token)` function.
///
/// On success records the identity on the connection, updates presence and
/// returns the identity; an unknown token returns `null`.
pub struct AuthHandler {
    verifier: Arc<dyn AuthVerifier>,
}

impl AuthHandler {
    /// Create a handler delegating to `verifier`.
    pub fn new(verifier: Arc<dyn AuthVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl MethodHandler<Context> for AuthHandler {
    async fn handle(&self, ctx: Context, params: Vec<Value>) -> Result<Value, HandlerError> {
        let token: String = arg(&params, 0, "token")?;
        let Some(identity) = self.verifier.verify(&token).await else {
            debug!(conn_id = %ctx.id(), "auth rejected");
            return Ok(Value::Null);
        };
        // The connection may have closed while the verifier ran.
        if !ctx.authenticate(identity.clone()) {
            debug!(conn_id = %ctx.id(), "auth completed after disconnect");
            return Err(HandlerError::msg("connection closed"));
        }
        info!(
            conn_id = %ctx.id(),
            user_id = %identity.user_id,
            is_admin = identity.is_admin,
            "client authenticated"
        );
        serde_json::to_value(&identity).map_err(|e| HandlerError::msg(e.to_string()))
    }
}
