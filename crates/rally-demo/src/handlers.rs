//! Chat-room functions exposed by the demo server.

use rally_core::ConnectionId;
use rally_rpc::HandlerError;
use rally_rpc::params::arg;
use rally_server::{Context, DisconnectReason, RallyServer};
use serde_json::{Value, json};
use tracing::info;

/// Register every demo function and listener on `server`.
pub fn register_all(server: &RallyServer) {
    server.register_fn("echo", |_ctx, params| async move {
        Ok(params.into_iter().next().unwrap_or(Value::Null))
    });
    server.register_fn("join", |ctx, params| async move {
        let topic: String = arg(&params, 0, "topic")?;
        Ok(json!(ctx.join(&topic)))
    });
    server.register_fn("leave", |ctx, params| async move {
        let topic: String = arg(&params, 0, "topic")?;
        Ok(json!(ctx.leave(&topic)))
    });
    server.register_fn("message", |ctx, params| async move { message(&ctx, &params) });
    server.register_fn("whoami", |ctx, _params| async move {
        Ok(serde_json::to_value(ctx.require_user()?)?)
    });
    server.register_fn("online", |ctx, _params| async move {
        Ok(json!(ctx.presence().online_users()))
    });
    server.register_fn("watch", |ctx, params| async move { watch(&ctx, &params) });
    server.register_fn("kick", |ctx, params| async move { kick(&ctx, &params) });

    let _ = server.on("typing", |ctx, params| {
        let Some(topic) = params.first().and_then(Value::as_str) else {
            return;
        };
        if ctx.topics().iter().any(|t| t == topic) {
            let _ = ctx.broadcast(topic, "onTyping", vec![json!(topic), sender(&ctx)]);
        }
    });
}

/// Display name for events: the user name once authenticated, otherwise the
/// connection id.
fn sender(ctx: &Context) -> Value {
    json!(ctx.user_name().unwrap_or_else(|| ctx.id().to_string()))
}

/// `message(topic, text)`: broadcast `onMessage(topic, sender, text)` to the
/// topic. The caller must be a member.
fn message(ctx: &Context, params: &[Value]) -> Result<Value, HandlerError> {
    let topic: String = arg(params, 0, "topic")?;
    let text: String = arg(params, 1, "text")?;
    if !ctx.topics().contains(&topic) {
        return Err(HandlerError::msg(format!("Not a member of '{topic}'")));
    }
    let delivered = ctx.broadcast(&topic, "onMessage", vec![json!(topic), sender(ctx), json!(text)]);
    Ok(json!(delivered))
}

/// `watch(userId)`: emit `onPresence(userId, online)` to the caller on every
/// presence change of `userId` until the caller disconnects.
fn watch(ctx: &Context, params: &[Value]) -> Result<Value, HandlerError> {
    let user_id: String = arg(params, 0, "userId")?;
    let watcher = ctx.clone();
    let watched = user_id.clone();
    let subscription = ctx.presence().add_listener(&user_id, move |online| {
        let _ = watcher.emit("onPresence", vec![json!(watched), json!(online)]);
    });
    ctx.on_close(move || {
        let _ = subscription.unsubscribe();
    });
    Ok(json!(ctx.presence().is_online(&user_id)))
}

/// `kick(connectionId)`: admin only. Closes another connection.
fn kick(ctx: &Context, params: &[Value]) -> Result<Value, HandlerError> {
    let admin = ctx.require_admin()?;
    let target: String = arg(params, 0, "connectionId")?;
    let Some(connection) = ctx.server().connection(&ConnectionId::from(target)) else {
        return Ok(json!(false));
    };
    info!(admin = %admin.user_id, target = %connection.id(), "kicking connection");
    connection.request_close(DisconnectReason::ClosedByServer);
    Ok(json!(true))
}
