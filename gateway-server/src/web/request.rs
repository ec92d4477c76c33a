//! Transport-agnostic request object passed to every endpoint handler.
//!
//! Both the HTTP adapter and the WebSocket JSON-RPC dispatcher build one of
//! these from their respective wire formats so handler bodies never need to
//! know which transport carried them in.

use std::sync::Arc;

use axum::http::Method;
use gateway_core::GatewayError;
use serde_json::{Map, Value};

use super::connection::ConnectionHandle;

/// Which transport a [`WebRequest`] arrived over.
#[derive(Debug, Clone)]
pub enum Transport {
    Http(Method),
    WebSocket,
}

/// A single incoming request, normalized from query params / JSON body /
/// WebSocket JSON-RPC `params` into a flat key-value map.
#[derive(Debug, Clone)]
pub struct WebRequest {
    endpoint: String,
    transport: Transport,
    args: Map<String, Value>,
    connection: Option<Arc<ConnectionHandle>>,
}

impl WebRequest {
    pub fn new(endpoint: impl Into<String>, transport: Transport, args: Map<String, Value>) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            args,
            connection: None,
        }
    }

    pub fn with_connection(mut self, connection: Arc<ConnectionHandle>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The HTTP-verb-equivalent action for this request: the real method
    /// over HTTP, or an explicit `action` argument over WebSocket — the
    /// same accommodation `moonraker.py`'s `WebRequest.get_action()` makes
    /// for multi-verb endpoints that collapse to one JSON-RPC method name.
    pub fn action(&self) -> Result<String, GatewayError> {
        match &self.transport {
            Transport::Http(method) => Ok(method.as_str().to_uppercase()),
            Transport::WebSocket => self.get_str("action", None).map(|a| a.to_uppercase()),
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.transport, Transport::WebSocket)
    }

    pub fn connection(&self) -> Option<&Arc<ConnectionHandle>> {
        self.connection.as_ref()
    }

    /// Raw argument map, for handlers that need more than the scalar accessors.
    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    fn field(&self, key: &str) -> Option<&Value> {
        self.args.get(key)
    }

    fn missing(key: &str) -> GatewayError {
        GatewayError::bad_request(format!("missing required argument '{key}'"))
    }

    pub fn get_str(&self, key: &str, default: Option<&str>) -> Result<String, GatewayError> {
        match self.field(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Null) | None => default.map(str::to_string).ok_or_else(|| Self::missing(key)),
            Some(other) => Ok(other.to_string()),
        }
    }

    pub fn get_int(&self, key: &str, default: Option<i64>) -> Result<i64, GatewayError> {
        match self.field(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| GatewayError::bad_request(format!("'{key}' is not an integer"))),
            Some(Value::String(s)) => s
                .parse()
                .map_err(|_| GatewayError::bad_request(format!("'{key}' is not an integer"))),
            Some(Value::Null) | None => default.ok_or_else(|| Self::missing(key)),
            Some(_) => Err(GatewayError::bad_request(format!("'{key}' is not an integer"))),
        }
    }

    pub fn get_float(&self, key: &str, default: Option<f64>) -> Result<f64, GatewayError> {
        match self.field(key) {
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| GatewayError::bad_request(format!("'{key}' is not a number"))),
            Some(Value::String(s)) => s
                .parse()
                .map_err(|_| GatewayError::bad_request(format!("'{key}' is not a number"))),
            Some(Value::Null) | None => default.ok_or_else(|| Self::missing(key)),
            Some(_) => Err(GatewayError::bad_request(format!("'{key}' is not a number"))),
        }
    }

    pub fn get_boolean(&self, key: &str, default: Option<bool>) -> Result<bool, GatewayError> {
        match self.field(key) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => match s.as_str() {
                "true" | "True" | "1" => Ok(true),
                "false" | "False" | "0" => Ok(false),
                _ => Err(GatewayError::bad_request(format!("'{key}' is not a boolean"))),
            },
            Some(Value::Null) | None => default.ok_or_else(|| Self::missing(key)),
            Some(_) => Err(GatewayError::bad_request(format!("'{key}' is not a boolean"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn get_str_falls_back_to_default_when_missing() {
        let req = WebRequest::new("/server/files/list", Transport::WebSocket, Map::new());
        assert_eq!(req.get_str("root", Some("gcodes")).unwrap(), "gcodes");
    }

    #[test]
    fn get_str_errors_when_missing_without_default() {
        let req = WebRequest::new("/server/files/list", Transport::WebSocket, Map::new());
        assert!(req.get_str("filename", None).is_err());
    }

    #[test]
    fn get_boolean_parses_string_form_values() {
        let req = WebRequest::new(
            "/server/files/upload",
            Transport::Http(Method::POST),
            args(&[("print", Value::String("true".into()))]),
        );
        assert!(req.get_boolean("print", Some(false)).unwrap());
    }

    #[test]
    fn get_int_rejects_wrong_type() {
        let req = WebRequest::new(
            "/x",
            Transport::WebSocket,
            args(&[("count", Value::String("not-a-number".into()))]),
        );
        assert!(req.get_int("count", None).is_err());
    }
}
