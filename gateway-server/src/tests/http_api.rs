use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;

use super::{send, test_state, with_connect_info};
use crate::config::Config;
use crate::routes::create_app;
use crate::state::AppState;

async fn body_json(response: axum::http::Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn ping_is_reachable_without_authorization() {
    let (_dir, state) = test_state().await;
    let app = create_app(state);

    let request = with_connect_info(Request::builder().uri("/ping")).body(Body::empty()).unwrap();
    let response = send(app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn server_info_rejects_unauthenticated_requests() {
    let (_dir, state) = test_state().await;
    let app = create_app(state);

    let request = with_connect_info(Request::builder().uri("/server/info")).body(Body::empty()).unwrap();
    let response = send(app, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn server_info_succeeds_with_valid_api_key() {
    let (_dir, state) = test_state().await;
    let api_key = state.auth.current_api_key().await;
    let app = create_app(state);

    let request = with_connect_info(Request::builder().uri("/server/info").header("X-Api-Key", &api_key))
        .body(Body::empty())
        .unwrap();
    let response = send(app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["result"]["klippy_connected"], false);
}

#[tokio::test]
async fn oneshot_token_is_consumed_after_one_use() {
    let (_dir, state) = test_state().await;
    let api_key = state.auth.current_api_key().await;
    let app = create_app(state);

    let issue_request = with_connect_info(Request::builder().uri("/access/oneshot_token").header("X-Api-Key", &api_key))
        .body(Body::empty())
        .unwrap();
    let issue_response = send(app.clone(), issue_request).await;
    assert_eq!(issue_response.status(), StatusCode::OK);
    let body = body_json(issue_response).await;
    let token = body["result"].as_str().unwrap().to_string();

    let first = with_connect_info(Request::builder().uri(format!("/server/info?token={token}")))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(app.clone(), first).await.status(), StatusCode::OK);

    let second = with_connect_info(Request::builder().uri(format!("/server/info?token={token}")))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(app, second).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unregistered_root_in_file_list_is_a_client_error() {
    let (_dir, state) = test_state().await;
    let api_key = state.auth.current_api_key().await;
    let app = create_app(state);

    let request = with_connect_info(
        Request::builder().uri("/server/files/list?root=nonexistent").header("X-Api-Key", &api_key),
    )
    .body(Body::empty())
    .unwrap();
    let response = send(app, request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_response_envelopes_filename_and_print_started() {
    let (_dir, state) = test_state().await;
    let api_key = state.auth.current_api_key().await;
    let app = create_app(state);

    let boundary = "gatewaytestboundary";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"test.gcode\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n\
         ;Layer height: 0.2\r\nG28\r\n\
         \r\n--{boundary}--\r\n"
    );

    let request = with_connect_info(
        Request::builder()
            .method("POST")
            .uri("/server/files/upload")
            .header("X-Api-Key", &api_key)
            .header("Content-Type", format!("multipart/form-data; boundary={boundary}")),
    )
    .body(Body::from(body))
    .unwrap();
    let response = send(app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["result"]["filename"], "test.gcode");
    assert_eq!(body["result"]["print_started"], false);
}

#[tokio::test]
async fn unrecognized_config_section_surfaces_as_failed_component() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.misc.database_path = dir.path().join("db");
    config.authorization.api_key_path = dir.path().join("api_key");
    config.host_connection.socket_path = Some(dir.path().join("nonexistent.sock"));
    config.file_manager.gcodes_path = Some(dir.path().join("gcodes"));
    tokio::fs::create_dir_all(config.file_manager.gcodes_path.as_ref().unwrap()).await.unwrap();
    config.extra.insert("power".to_string(), toml::Value::Table(toml::Table::new()));

    let state = AppState::build(config).await.unwrap();
    let api_key = state.auth.current_api_key().await;
    let app = create_app(state);

    let request = with_connect_info(Request::builder().uri("/server/info").header("X-Api-Key", &api_key))
        .body(Body::empty())
        .unwrap();
    let response = send(app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let failed = body["result"]["failed_components"].as_array().unwrap();
    assert!(failed.iter().any(|name| name == "power"));
}

#[tokio::test]
async fn gcodes_file_list_reflects_registered_root() {
    let (_dir, state) = test_state().await;
    let api_key = state.auth.current_api_key().await;
    let app = create_app(state);

    let request =
        with_connect_info(Request::builder().uri("/server/files/list?root=gcodes").header("X-Api-Key", &api_key))
            .body(Body::empty())
            .unwrap();
    let response = send(app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["result"]["files"].as_array().unwrap().is_empty());
}
