use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::cwd_allowed;
use crate::manager::ManagerStatus;
use crate::pty::SpawnCommand;
use crate::session::{RegistryError, SessionInfo};

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Deserialize)]
pub(super) struct CreateSessionRequest {
    cwd: PathBuf,
    #[serde(default = "default_cols")]
    cols: u16,
    #[serde(default = "default_rows")]
    rows: u16,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateSessionResponse {
    session_id: String,
}

/// Create a session bound to an authorized working directory.
///
/// The scope check lives here, in the HTTP layer — the registry trusts
/// that its caller has already validated `cwd`.
pub(super) async fn session_create(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    if req.cols == 0 || req.rows == 0 {
        return Err(ApiError::InvalidRequest(
            "cols and rows must be nonzero".into(),
        ));
    }
    if !cwd_allowed(&state.config.allowed_roots, &req.cwd) {
        return Err(ApiError::CwdNotAuthorized(req.cwd.display().to_string()));
    }

    let command = match &state.config.program {
        Some(program) => SpawnCommand::Program(program.clone()),
        None => SpawnCommand::Shell,
    };

    let session_id = state
        .sessions
        .create(req.cwd, command, req.rows, req.cols)
        .await
        .map_err(|e| match e {
            RegistryError::MaxSessionsReached => ApiError::MaxSessionsReached,
            other => ApiError::SessionCreateFailed(other.to_string()),
        })?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse { session_id }),
    ))
}

pub(super) async fn session_list(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list())
}

#[derive(Deserialize)]
pub(super) struct InputRequest {
    data: String,
}

pub(super) async fn session_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.write(&id, Bytes::from(req.data)).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::SessionNotFound(id))
    }
}

#[derive(Deserialize)]
pub(super) struct ResizeRequest {
    cols: u16,
    rows: u16,
}

pub(super) async fn session_resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<StatusCode, ApiError> {
    if req.cols == 0 || req.rows == 0 {
        return Err(ApiError::InvalidRequest(
            "cols and rows must be nonzero".into(),
        ));
    }
    if state.sessions.resize(&id, req.cols, req.rows) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::SessionNotFound(id))
    }
}

pub(super) async fn session_kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.kill(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::SessionNotFound(id))
    }
}

pub(super) async fn manager_start(
    State(state): State<AppState>,
) -> Result<Json<ManagerStatus>, ApiError> {
    state
        .manager
        .start()
        .map_err(|e| ApiError::ManagerControlFailed(e.to_string()))?;
    Ok(Json(state.manager.status()))
}

pub(super) async fn manager_stop(
    State(state): State<AppState>,
) -> Result<Json<ManagerStatus>, ApiError> {
    state
        .manager
        .stop()
        .map_err(|e| ApiError::ManagerControlFailed(e.to_string()))?;
    Ok(Json(state.manager.status()))
}

#[derive(Deserialize)]
pub(super) struct SendCommandRequest {
    command: String,
}

/// Fire-and-forget submission. 202 means "accepted into the queue", not
/// "succeeded" — outcomes surface on /manager/events and in logs only.
pub(super) async fn manager_send_command(
    State(state): State<AppState>,
    Json(req): Json<SendCommandRequest>,
) -> Result<StatusCode, ApiError> {
    if req.command.trim().is_empty() {
        return Err(ApiError::InvalidRequest("command must not be empty".into()));
    }
    if !state.manager.status().running {
        return Err(ApiError::ManagerNotRunning);
    }
    state.manager.send_command(req.command);
    Ok(StatusCode::ACCEPTED)
}

pub(super) async fn manager_status(State(state): State<AppState>) -> Json<ManagerStatus> {
    Json(state.manager.status())
}
