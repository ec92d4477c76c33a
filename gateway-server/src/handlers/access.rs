//! `/access/api_key`, `/access/oneshot_token`.
//!
//! Grounded on `authorization.py::_handle_apikey_request`/`_handle_token_request`.

use gateway_core::GatewayError;
use serde_json::Value;

use crate::state::AppState;
use crate::web::request::Transport;
use crate::web::WebRequest;

pub async fn api_key(req: WebRequest, state: AppState) -> Result<Value, GatewayError> {
    match req.transport() {
        Transport::Http(method) if method.as_str() == "POST" => Ok(Value::String(state.auth.rotate_api_key().await?)),
        _ => Ok(Value::String(state.auth.current_api_key().await)),
    }
}

pub async fn oneshot_token(_req: WebRequest, state: AppState) -> Result<Value, GatewayError> {
    Ok(Value::String(state.auth.issue_oneshot_token().await))
}
