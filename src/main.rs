//! muxd - process session daemon
//!
//! Serves the session and manager HTTP API on a single TCP listener. Sessions
//! are PTY-backed interactive processes streamed over SSE; the manager
//! serializes submitted commands into sequential one-shot CLI invocations.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use muxd::{
    api,
    config::Config,
    manager::CommandManager,
    reaper::IdleReaper,
    sentinel::RunSentinel,
    session::SessionRegistry,
};

/// muxd - process session daemon
#[derive(Parser, Debug)]
#[command(name = "muxd", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP API server
    #[arg(long, env = "MUXD_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Path to the TOML config file
    #[arg(long, env = "MUXD_CONFIG", default_value = "muxd.toml")]
    config: PathBuf,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "muxd=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?
        .unwrap_or_default();

    let sessions = SessionRegistry::with_max_sessions(config.sessions.max_sessions);

    let sentinel_path = config
        .manager
        .sentinel_path
        .clone()
        .unwrap_or_else(RunSentinel::default_path);
    let manager = CommandManager::new(
        config.manager.to_manager_config(),
        RunSentinel::new(sentinel_path),
    );

    let shutdown = CancellationToken::new();

    let reaper = IdleReaper::new(
        sessions.clone(),
        config.sessions.reaper_interval(),
        config.sessions.idle_max_age(),
    );
    let reaper_handle = tokio::spawn(reaper.run(shutdown.clone()));

    let state = api::AppState {
        sessions: sessions.clone(),
        manager: manager.clone(),
        config: Arc::new(config.sessions.clone()),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    tracing::info!(addr = %cli.bind, "muxd listening");

    let shutdown_for_server = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::select! {
                _ = ctrl_c => {}
                _ = shutdown_for_server.cancelled() => {}
            }
        })
        .await
        .context("HTTP server error")?;

    tracing::info!("shutting down");
    shutdown.cancel();
    reaper_handle.abort();

    if let Err(e) = manager.shutdown() {
        tracing::warn!(error = %e, "failed to release manager sentinel");
    }
    if let Some(escalation) = sessions.drain() {
        let _ = escalation.await;
    }

    Ok(())
}
