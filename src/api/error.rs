use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code
/// string, and a human-readable message. Implements [`IntoResponse`] so
/// handlers can return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 404 - A specific session id was not found.
    SessionNotFound(String),
    /// 403 - The requested working directory is outside the authorized roots.
    CwdNotAuthorized(String),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 500 - Failed to create a session (PTY spawn error, etc.).
    SessionCreateFailed(String),
    /// 503 - Maximum session count reached.
    MaxSessionsReached,
    /// 500 - Failed to start or stop the manager.
    ManagerControlFailed(String),
    /// 503 - A command was submitted before the manager was started.
    ManagerNotRunning,
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::CwdNotAuthorized(_) => StatusCode::FORBIDDEN,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SessionCreateFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::MaxSessionsReached => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ManagerControlFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ManagerNotRunning => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::CwdNotAuthorized(_) => "cwd_not_authorized",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::SessionCreateFailed(_) => "session_create_failed",
            ApiError::MaxSessionsReached => "max_sessions_reached",
            ApiError::ManagerControlFailed(_) => "manager_control_failed",
            ApiError::ManagerNotRunning => "manager_not_running",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::CwdNotAuthorized(path) => {
                format!("Working directory is not within an authorized root: {}.", path)
            }
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::SessionCreateFailed(detail) => {
                format!("Failed to create session: {}.", detail)
            }
            ApiError::MaxSessionsReached => "Maximum number of sessions reached.".to_string(),
            ApiError::ManagerControlFailed(detail) => {
                format!("Manager control operation failed: {}.", detail)
            }
            ApiError::ManagerNotRunning => {
                "Manager is not running. Start it before submitting commands.".to_string()
            }
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
