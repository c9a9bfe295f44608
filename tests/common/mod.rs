#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;

use muxd::api::{self, AppState};
use muxd::config::SessionsConfig;
use muxd::manager::{CommandManager, ManagerConfig};
use muxd::sentinel::RunSentinel;
use muxd::session::SessionRegistry;

/// Test fixture bundling the app state with the temp dirs that back it.
///
/// The temp dirs must stay alive for the duration of the test: the sentinel
/// lives in one, and sessions are created under the other.
pub struct TestApp {
    pub state: AppState,
    pub workdir: TempDir,
    sentinel_dir: TempDir,
}

impl TestApp {
    pub fn router(&self) -> axum::Router {
        api::router(self.state.clone())
    }

    pub fn workdir_path(&self) -> PathBuf {
        self.workdir.path().to_path_buf()
    }
}

/// Build an AppState with an empty registry and a manager whose sentinel
/// lives in a private temp dir. The manager's CLI is `cat`, which consumes
/// the prompt from stdin and exits 0 — enough for endpoint-level tests.
pub fn create_test_app() -> TestApp {
    create_test_app_with_config(SessionsConfig::default())
}

pub fn create_test_app_with_config(sessions_config: SessionsConfig) -> TestApp {
    let workdir = TempDir::new().unwrap();
    let sentinel_dir = TempDir::new().unwrap();

    let manager = CommandManager::new(
        ManagerConfig {
            program: "cat".to_string(),
            args: vec![],
            prompt_preamble: String::new(),
            command_timeout: Duration::from_secs(10),
        },
        RunSentinel::new(sentinel_dir.path().join("manager.run")),
    );

    let state = AppState {
        sessions: SessionRegistry::new(),
        manager,
        config: Arc::new(sessions_config),
    };

    TestApp {
        state,
        workdir,
        sentinel_dir,
    }
}

/// Start a real HTTP server for streaming tests and return its address.
pub async fn start_server(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Collect a response body as parsed JSON.
pub async fn json_body(response: axum::http::Response<axum::body::Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
