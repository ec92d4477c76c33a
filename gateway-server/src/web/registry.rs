//! Endpoint registry: one registration site per logical operation, shared
//! by both the HTTP adapter and the WebSocket JSON-RPC dispatcher.
//!
//! Grounded on `ferrex-server/src/routes/v1.rs`'s router-composition shape
//! (`Router::new()` plus chained `.route()`/`.merge()` calls taking shared
//! state), generalized so a single handler closure serves both transports
//! instead of being duplicated per transport the way a plain axum `Router`
//! would require.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter};
use axum::{Json, Router};
use gateway_core::GatewayError;
use serde_json::{Map, Value};

use super::request::{Transport, WebRequest};
use crate::state::AppState;

pub type EndpointFuture = Pin<Box<dyn Future<Output = Result<Value, GatewayError>> + Send>>;
pub type EndpointHandler = Arc<dyn Fn(WebRequest, AppState) -> EndpointFuture + Send + Sync>;

/// Which transports an endpoint answers on. A handful of endpoints are
/// intentionally one-sided (`/access/oneshot_token` is HTTP-only since a
/// WebSocket client is, by definition, already past that gate; deleting a
/// file mid-print is WS-only so a client can correlate the response with
/// the request that triggered it).
#[derive(Debug, Clone, Copy)]
pub struct Protocols {
    pub http: bool,
    pub websocket: bool,
}

impl Protocols {
    pub const BOTH: Self = Self { http: true, websocket: true };
    pub const HTTP_ONLY: Self = Self { http: true, websocket: false };
    pub const WS_ONLY: Self = Self { http: false, websocket: true };
}

pub struct Endpoint {
    pub methods: Vec<Method>,
    pub protocols: Protocols,
    pub wrap_result: bool,
    pub handler: EndpointHandler,
}

/// The full set of registered endpoints, keyed by their canonical HTTP path
/// (e.g. `/server/files/list`). WebSocket JSON-RPC method names are derived
/// from the same path via [`path_to_rpc_method`]/[`rpc_method_to_path`].
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: HashMap<String, Arc<Endpoint>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        path: impl Into<String>,
        methods: &[Method],
        protocols: Protocols,
        wrap_result: bool,
        handler: EndpointHandler,
    ) {
        self.endpoints.insert(
            path.into(),
            Arc::new(Endpoint {
                methods: methods.to_vec(),
                protocols,
                wrap_result,
                handler,
            }),
        );
    }

    pub fn get(&self, path: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(path).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Endpoint>)> {
        self.endpoints.iter()
    }
}

/// `/server/files/list` <-> `server.files.list`
pub fn path_to_rpc_method(path: &str) -> String {
    path.trim_start_matches('/').replace('/', ".")
}

/// `server.files.list` <-> `/server/files/list`
pub fn rpc_method_to_path(method: &str) -> String {
    format!("/{}", method.replace('.', "/"))
}

fn method_filter(methods: &[Method]) -> MethodFilter {
    let mut filter = MethodFilter::empty();
    for method in methods {
        let flag = match *method {
            Method::GET => MethodFilter::GET,
            Method::POST => MethodFilter::POST,
            Method::DELETE => MethodFilter::DELETE,
            Method::PUT => MethodFilter::PUT,
            _ => continue,
        };
        filter = filter.or(flag);
    }
    filter
}

/// Merges query parameters and a JSON object body (if present) into a
/// single argument map; body keys win on conflict.
fn merge_args(query: HashMap<String, String>, body: &Bytes) -> Result<Map<String, Value>, GatewayError> {
    let mut args: Map<String, Value> = query.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    if !body.is_empty() {
        let parsed: Value = serde_json::from_slice(body)?;
        if let Value::Object(map) = parsed {
            for (key, value) in map {
                args.insert(key, value);
            }
        }
    }
    Ok(args)
}

async fn http_dispatch(
    endpoint: Arc<Endpoint>,
    path: String,
    state: AppState,
    method: Method,
    query: HashMap<String, String>,
    body: Bytes,
) -> Response {
    let args = match merge_args(query, &body) {
        Ok(args) => args,
        Err(err) => return err.into_response(),
    };
    let request = WebRequest::new(path, Transport::Http(method), args);
    match (endpoint.handler)(request, state).await {
        Ok(value) if endpoint.wrap_result => (StatusCode::OK, Json(serde_json::json!({ "result": value }))).into_response(),
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Builds the axum sub-router serving every HTTP-capable registered endpoint.
pub fn build_http_router(registry: &EndpointRegistry) -> Router<AppState> {
    let mut router = Router::new();
    for (path, endpoint) in registry.iter() {
        if !endpoint.protocols.http {
            continue;
        }
        let filter = method_filter(&endpoint.methods);
        let endpoint = endpoint.clone();
        let path_owned = path.clone();
        router = router.route(
            path,
            on(
                filter,
                move |State(state): State<AppState>, method: Method, Query(query): Query<HashMap<String, String>>, body: Bytes| {
                    let endpoint = endpoint.clone();
                    let path_owned = path_owned.clone();
                    async move { http_dispatch(endpoint, path_owned, state, method, query, body).await }
                },
            ),
        );
    }
    router
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_and_rpc_method_round_trip() {
        assert_eq!(path_to_rpc_method("/server/files/list"), "server.files.list");
        assert_eq!(rpc_method_to_path("server.files.list"), "/server/files/list");
    }

    #[test]
    fn merge_args_prefers_body_over_query() {
        let query = HashMap::from([("root".to_string(), "config".to_string())]);
        let body = Bytes::from_static(br#"{"root":"gcodes"}"#);
        let args = merge_args(query, &body).unwrap();
        assert_eq!(args.get("root").unwrap(), "gcodes");
    }
}
