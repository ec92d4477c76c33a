//! Axum middleware applying spec §4.5's `check_authorized` precedence
//! chain to every HTTP request (including the `/websocket` upgrade
//! handshake, which is itself an HTTP request) before it reaches any
//! handler.
//!
//! Grounded on `authorization.py::AuthorizedRequestHandler.prepare` (the
//! teacher's own middleware chain is flat function composition rather
//! than a base-class override, so this follows `ferrex-server`'s
//! `tower::Layer`-via-`from_fn` idiom instead).

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use gateway_core::auth::AuthContext;

use crate::state::AppState;

/// Paths exempt from authorization: health probes that carry no
/// printer-host or filesystem surface, not part of the spec's canonical
/// endpoint set.
const UNAUTHENTICATED_PATHS: &[&str] = &["/ping", "/health"];

/// Registered ahead of every other layer via `axum::middleware::from_fn_with_state`.
pub async fn auth_layer(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if UNAUTHENTICATED_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let api_key_header = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let token_query_param = request.uri().query().and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
    });

    let ctx = AuthContext {
        remote_addr: Some(addr.ip()),
        api_key_header,
        token_query_param,
    };

    match state.auth.check_authorized(&ctx).await {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}
