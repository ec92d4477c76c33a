//! WebSocket JSON-RPC 2.0 multiplexing.
//!
//! Grounded on the teacher's `handlers/handle_websocket.rs` pattern: split
//! the socket, spawn a task that forwards an `mpsc` channel into the
//! sender half, and run the receive loop against the other half. Requests
//! (`id` present) get a matching response frame; notifications (`id`
//! absent) are dispatched and never answered, mirroring
//! `moonraker.py`'s websocket handler which only ever writes a response
//! when the inbound frame carried an id.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::registry::rpc_method_to_path;
use super::request::{Transport, WebRequest};
use crate::state::AppState;

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    use futures_util::{SinkExt, StreamExt};

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
    let connection = state.connections.register(outbound_tx);

    let forward_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = frame.to_string();
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(_) => break,
        };
        match message {
            Message::Text(text) => {
                if let Err(err) = dispatch_frame(&text, &state, &connection).await {
                    warn!("malformed websocket frame: {err}");
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    state.connections.unregister(connection.id);
    forward_task.abort();
    debug!("websocket connection {} closed", connection.id);
}

async fn dispatch_frame(
    text: &str,
    state: &AppState,
    connection: &std::sync::Arc<super::connection::ConnectionHandle>,
) -> Result<(), serde_json::Error> {
    let frame: Value = serde_json::from_str(text)?;
    let id = frame.get("id").cloned();
    let method = match frame.get("method").and_then(Value::as_str) {
        Some(method) => method.to_string(),
        None => {
            if let Some(id) = id {
                connection.send(json!({
                    "id": id,
                    "error": {"code": 400, "message": "missing 'method'"},
                }));
            }
            return Ok(());
        }
    };
    let params = match frame.get("params") {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => serde_json::Map::new(),
        Some(_) => {
            if let Some(id) = id {
                connection.send(json!({"id": id, "error": {"code": 400, "message": "'params' must be an object"}}));
            }
            return Ok(());
        }
    };

    let path = rpc_method_to_path(&method);
    let Some(endpoint) = state.endpoints.get(&path) else {
        if let Some(id) = id {
            connection.send(json!({"id": id, "error": {"code": 404, "message": format!("unknown method '{method}'")}}));
        }
        return Ok(());
    };
    if !endpoint.protocols.websocket {
        if let Some(id) = id {
            connection.send(json!({"id": id, "error": {"code": 400, "message": format!("'{method}' is not available over websocket")}}));
        }
        return Ok(());
    }

    let request = WebRequest::new(path, Transport::WebSocket, params).with_connection(connection.clone());
    let state = state.clone();
    let connection = connection.clone();
    tokio::spawn(async move {
        let result = (endpoint.handler)(request, state).await;
        let Some(id) = id else { return };
        let frame = match result {
            Ok(value) => json!({"id": id, "result": value}),
            Err(err) => json!({"id": id, "error": err.as_rpc_error()}),
        };
        connection.send(frame);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_method_resolves_to_registered_path() {
        assert_eq!(rpc_method_to_path("server.info"), "/server/info");
    }
}
