//! `RallyServer`: Axum HTTP + WebSocket server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use rally_core::{Codec, JsonCodec};
use rally_rpc::{HandlerError, ListenerId, MethodHandler};
use serde_json::Value;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{AUTH_METHOD, AuthHandler, AuthVerifier};
use crate::config::ServerConfig;
use crate::context::Context;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::presence::PresenceTracker;
use crate::shutdown::ShutdownCoordinator;
use crate::state::ServerState;
use crate::websocket::session::{SessionOptions, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connections, topics, presence, and registries.
    pub state: Arc<ServerState>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, if installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The Rally server role.
///
/// Functions and listeners may be registered before or after
/// [`RallyServer::listen`]; registration affects every connection.
pub struct RallyServer {
    config: Arc<ServerConfig>,
    state: Arc<ServerState>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl RallyServer {
    /// Create a server speaking JSON.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_codec(config, Arc::new(JsonCodec))
    }

    /// Create a server with a custom codec.
    pub fn with_codec(config: ServerConfig, codec: Arc<dyn Codec>) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(ServerState::new(codec)),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Register (or replace) a function clients may call.
    pub fn register(&self, method: &str, handler: impl MethodHandler<Context> + 'static) {
        self.state.methods().register(method, handler);
    }

    /// Register (or replace) an async closure as a function.
    pub fn register_fn<F, Fut>(&self, method: &str, f: F)
    where
        F: Fn(Context, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.state.methods().register_fn(method, f);
    }

    /// Handle client events named `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(Context, Vec<Value>) + Send + Sync + 'static,
    {
        self.state.listeners().on(event, listener)
    }

    /// Remove a listener registered with [`RallyServer::on`].
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.state.listeners().off(event, id)
    }

    /// Install the token verifier behind the built-in `auth` function.
    pub fn set_verifier(&self, verifier: impl AuthVerifier) {
        self.register(AUTH_METHOD, AuthHandler::new(Arc::new(verifier)));
    }

    /// Run `callback` each time `topic` loses its last member.
    pub fn on_topic_emptied<F>(&self, topic: &str, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.state.groups().on_emptied(topic, callback);
    }

    // ── Groups & presence ───────────────────────────────────────────────

    /// Send an `Event` to every member of `topic`.
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

    /// Presence tracker.
    pub fn presence(&self) -> &PresenceTracker {
        self.state.presence()
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// Shared server state.
    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    // ── HTTP ────────────────────────────────────────────────────────────

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let app = AppState {
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
            config: self.config.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(app)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "rally server listening");

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server terminated");
            }
        });
        Ok((local_addr, handle))
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    if app.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let max = app.config.max_connections;
    if app.state.connection_count() >= max {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(max_connections = max, "connection limit reached, rejecting upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let options = SessionOptions {
        heartbeat_interval: app.config.heartbeat_interval(),
        send_queue_capacity: app.config.send_queue_capacity,
    };
    let state = app.state.clone();
    let token = app.shutdown.token();
    ws.max_message_size(app.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, state, options, token))
        .into_response()
}

/// GET /health
async fn health_handler(State(app): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        app.start_time,
        app.state.connection_count(),
        app.state.groups().topic_count(),
        app.state.presence().identity_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(app): State<AppState>) -> Response {
    match &app.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
