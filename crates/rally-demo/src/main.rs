//! # rally-demo
//!
//! Demo server binary: wires a [`RallyServer`] with chat-room functions,
//! static token auth, and presence watching, then serves until Ctrl-C.

#![deny(unsafe_code)]

mod handlers;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rally_core::Identity;
use rally_core::logging::{LogFormat, init_subscriber};
use rally_server::{RallyServer, StaticTokenVerifier, load_config};
use tracing::{info, warn};

/// Rally demo server.
#[derive(Parser, Debug)]
#[command(name = "rally-demo", about = "Rally demo server")]
struct Cli {
    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// JSON config file merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,

    /// Accepted token, as `TOKEN=USER_ID` or `TOKEN=USER_ID:NAME`. Repeatable.
    #[arg(long = "user", value_parser = parse_user)]
    users: Vec<(String, Identity)>,

    /// User id granted admin rights. Repeatable.
    #[arg(long = "admin")]
    admins: Vec<String>,
}

fn parse_user(raw: &str) -> Result<(String, Identity), String> {
    let (token, user) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TOKEN=USER_ID, got '{raw}'"))?;
    let (user_id, user_name) = user.split_once(':').unwrap_or((user, user));
    if token.is_empty() || user_id.is_empty() {
        return Err(format!("token and user id must be non-empty in '{raw}'"));
    }
    Ok((token.to_owned(), Identity::new(user_id, user_name)))
}

fn build_verifier(users: Vec<(String, Identity)>, admins: &[String]) -> StaticTokenVerifier {
    users
        .into_iter()
        .fold(StaticTokenVerifier::new(), |verifier, (token, identity)| {
            let identity = if admins.contains(&identity.user_id) {
                identity.admin()
            } else {
                identity
            };
            verifier.with_token(token, identity)
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let format = if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(&args.log_level, format);

    let mut config = load_config(args.config.as_deref()).context("Failed to load config")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let mut server = RallyServer::new(config);
    match rally_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => warn!(error = %e, "metrics recorder unavailable, /metrics disabled"),
    }

    let verifier = build_verifier(args.users, &args.admins);
    if verifier.is_empty() {
        warn!("no --user tokens configured, every auth call will fail");
    }
    server.set_verifier(verifier);
    handlers::register_all(&server);

    let (addr, serve) = server.listen().await.context("Failed to start server")?;
    info!(%addr, ws = %format!("ws://{addr}/ws"), "rally demo ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received");

    let clean = server
        .shutdown()
        .graceful_shutdown(server.state(), vec![serve], None)
        .await;
    if !clean {
        warn!("some connections did not close in time");
    }
    Ok(())
}
