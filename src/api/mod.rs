pub mod error;
mod handlers;
mod stream;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::SessionsConfig;
use crate::manager::CommandManager;
use crate::session::SessionRegistry;

use handlers::*;
use stream::{manager_events, session_stream};

/// Shared state handed to every handler.
///
/// The registry and manager are constructed once at process start and
/// injected here — no ambient globals.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub manager: CommandManager,
    pub config: Arc<SessionsConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(session_create).get(session_list))
        .route("/sessions/{id}/input", post(session_input))
        .route("/sessions/{id}/resize", post(session_resize))
        .route("/sessions/{id}", delete(session_kill))
        .route("/sessions/{id}/stream", get(session_stream))
        .route("/manager/start", post(manager_start))
        .route("/manager/stop", post(manager_stop))
        .route("/manager/commands", post(manager_send_command))
        .route("/manager/status", get(manager_status))
        .route("/manager/events", get(manager_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
