//! Integration tests exercising the fully assembled `Router`, in the same
//! style as the teacher's `src/tests/` module tree (`https_integration_test.rs`,
//! `auth_integration_tests.rs`): build a real `AppState`, drive the router
//! with `tower::ServiceExt::oneshot`, assert on the HTTP response.

mod http_api;

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use tower::ServiceExt;

use crate::config::Config;
use crate::state::AppState;

/// Builds an `AppState` rooted at a fresh temp directory: no printer host
/// is reachable, so `klippy_connected` stays false, but every HTTP-facing
/// piece (auth, roots, database, endpoint registry) is real.
pub(crate) async fn test_state() -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.misc.database_path = dir.path().join("db");
    config.authorization.api_key_path = dir.path().join("api_key");
    config.host_connection.socket_path = Some(dir.path().join("nonexistent.sock"));
    config.file_manager.gcodes_path = Some(dir.path().join("gcodes"));
    tokio::fs::create_dir_all(config.file_manager.gcodes_path.as_ref().unwrap()).await.unwrap();

    let state = AppState::build(config).await.unwrap();
    (dir, state)
}

fn local_addr() -> SocketAddr {
    "127.0.0.1:9999".parse().unwrap()
}

/// Attaches the `ConnectInfo` extension the auth middleware extracts,
/// standing in for what `into_make_service_with_connect_info` inserts
/// when actually serving.
pub(crate) fn with_connect_info(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.extension(ConnectInfo(local_addr()))
}

pub(crate) async fn send(app: axum::Router, request: Request<Body>) -> axum::http::Response<Body> {
    app.oneshot(request).await.unwrap()
}
