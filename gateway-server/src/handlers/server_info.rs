//! `/server/info`, `/server/config`, `/server/restart`.

use gateway_core::GatewayError;
use serde_json::{json, Value};

use crate::state::AppState;
use crate::web::WebRequest;

pub async fn info(_req: WebRequest, state: AppState) -> Result<Value, GatewayError> {
    let host_state = state.host.state();
    let components = state.components.lock().await;
    Ok(json!({
        "klippy_connected": host_state.accepts_requests(),
        "klippy_state": format!("{host_state:?}").to_lowercase(),
        "components": components.registered_names(),
        "failed_components": components.failed_components().iter().map(|f| &f.name).collect::<Vec<_>>(),
        "registered_directories": state.roots.registered_names(),
        "websocket_count": state.connections.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn config(_req: WebRequest, state: AppState) -> Result<Value, GatewayError> {
    serde_json::to_value(&*state.config).map_err(GatewayError::from)
}

pub async fn restart(_req: WebRequest, state: AppState) -> Result<Value, GatewayError> {
    state.host.shutdown().await;
    state.host.spawn();
    Ok(Value::String("ok".to_string()))
}
