//! Endpoint registration and final `Router` assembly.
//!
//! Grounded on `ferrex-server/src/main.rs::create_app()`: CORS outermost,
//! then request tracing, then `.with_state()` last. The endpoint registry
//! stands in for the teacher's `routes::create_api_router`/`routes/v1.rs`
//! composition — one registration site serves both HTTP and WebSocket
//! instead of a route tree duplicated per transport.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::Method;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use gateway_core::GatewayError;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{access, files, server_info, subscribe};
use crate::state::AppState;
use crate::web::registry::{build_http_router, path_to_rpc_method, EndpointHandler, Protocols};
use crate::web::{auth_layer, websocket, EndpointRegistry, WebRequest};

fn wrap<F, Fut>(handler: F) -> EndpointHandler
where
    F: Fn(WebRequest, AppState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, GatewayError>> + Send + 'static,
{
    Arc::new(move |req, state| Box::pin(handler(req, state)))
}

/// Registers every canonical endpoint named in spec §6. Called once during
/// `AppState::build` — the registry itself is stateless with respect to
/// any particular `AppState` instance, since handlers receive it per call.
pub fn build_registry() -> EndpointRegistry {
    let mut registry = EndpointRegistry::new();

    registry.register("/server/info", &[Method::GET], Protocols::BOTH, true, wrap(server_info::info));
    registry.register("/server/config", &[Method::GET], Protocols::BOTH, true, wrap(server_info::config));
    registry.register("/server/restart", &[Method::POST], Protocols::BOTH, true, wrap(server_info::restart));

    registry.register("/server/files/list", &[Method::GET], Protocols::BOTH, true, wrap(files::list));
    registry.register("/server/files/metadata", &[Method::GET], Protocols::BOTH, true, wrap(files::metadata));
    registry.register(
        "/server/files/directory",
        &[Method::GET, Method::POST, Method::DELETE],
        Protocols::BOTH,
        true,
        wrap(files::directory),
    );
    registry.register("/server/files/move", &[Method::POST], Protocols::BOTH, true, wrap(files::move_file));
    registry.register("/server/files/copy", &[Method::POST], Protocols::BOTH, true, wrap(files::copy_file));
    registry.register("/server/files/delete_file", &[Method::DELETE], Protocols::WS_ONLY, true, wrap(files::delete_file));

    registry.register("/access/api_key", &[Method::GET, Method::POST], Protocols::HTTP_ONLY, true, wrap(access::api_key));
    registry.register("/access/oneshot_token", &[Method::GET], Protocols::HTTP_ONLY, true, wrap(access::oneshot_token));

    registry.register("/printer/objects/subscribe", &[Method::POST], Protocols::WS_ONLY, true, wrap(subscribe::subscribe));

    registry
}

async fn ping() -> impl IntoResponse {
    Json(json!({"result": "pong"}))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "klippy_connected": state.host.state().accepts_requests(),
    }))
}

async fn upload(state: State<AppState>, multipart: Multipart) -> Result<Json<Value>, GatewayError> {
    let Json(v) = crate::web::upload::handle_upload(state, multipart).await?;
    Ok(Json(json!({"result": v})))
}

/// Assembles the full axum `Router`: registered endpoints, the upload
/// routes (multipart doesn't fit the uniform registry dispatch), the
/// websocket upgrade endpoint, then `/ping`/`/health`, then CORS/trace
/// layering, then state — in that order, matching the teacher's
/// `create_app`.
pub fn create_app(state: AppState) -> Router {
    let endpoint_router = build_http_router(&state.endpoints);

    let mut router = Router::new()
        .route("/ping", get(ping))
        .route("/health", get(health))
        .route("/websocket", get(websocket::upgrade))
        .route("/server/files/upload", axum::routing::post(upload))
        .route("/api/files/local", axum::routing::post(upload))
        .merge(endpoint_router)
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth_layer))
        .layer(TraceLayer::new_for_http());

    if state.config.server.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_methods_mirror_registered_paths() {
        let registry = build_registry();
        for (path, endpoint) in registry.iter() {
            if endpoint.protocols.websocket {
                assert_eq!(crate::web::registry::rpc_method_to_path(&path_to_rpc_method(path)), *path);
            }
        }
    }
}
