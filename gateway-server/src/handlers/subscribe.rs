//! `printer.objects.subscribe` — WebSocket-only. Updates this connection's
//! own subscription view, folds it into the host's subscription superset,
//! and returns the status pruned back down to what this connection asked
//! for. Grounded on `moonraker.py::Server._handle_subscription_request`.

use std::collections::HashMap;

use gateway_core::GatewayError;
use serde_json::{json, Map, Value};

use crate::state::AppState;
use crate::web::WebRequest;

pub async fn subscribe(req: WebRequest, state: AppState) -> Result<Value, GatewayError> {
    let connection = req
        .connection()
        .cloned()
        .ok_or_else(|| GatewayError::bad_request("subscriptions require a websocket connection"))?;

    let objects_arg = req
        .args()
        .get("objects")
        .and_then(Value::as_object)
        .ok_or_else(|| GatewayError::bad_request("missing 'objects' argument"))?;

    let mut wanted: HashMap<String, Option<Vec<String>>> = HashMap::new();
    for (name, fields) in objects_arg {
        let parsed = match fields {
            Value::Null => None,
            Value::Array(items) => Some(items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()),
            _ => return Err(GatewayError::bad_request(format!("invalid field list for object '{name}'"))),
        };
        wanted.insert(name.clone(), parsed);
    }

    connection.set_subscription(wanted.clone());
    let response = state.host.reconcile_and_subscribe(wanted.clone()).await?;
    let all_status = response.get("status").and_then(Value::as_object).cloned().unwrap_or_default();

    let mut pruned = Map::new();
    for (object, fields) in &wanted {
        if let Some(value) = all_status.get(object) {
            pruned.insert(object.clone(), prune(value, fields));
        }
    }
    Ok(json!({"status": pruned}))
}

fn prune(value: &Value, fields: &Option<Vec<String>>) -> Value {
    match (value, fields) {
        (Value::Object(map), Some(wanted)) => {
            Value::Object(map.iter().filter(|(k, _)| wanted.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect())
        }
        _ => value.clone(),
    }
}
