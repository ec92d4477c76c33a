//! Transport layer: uniform requests, the endpoint registry, the HTTP
//! adapter, WebSocket JSON-RPC multiplexing, and multipart upload ingest.

pub mod auth_middleware;
pub mod connection;
pub mod registry;
pub mod request;
pub mod upload;
pub mod websocket;

pub use auth_middleware::auth_layer;
pub use connection::{ConnectionHandle, ConnectionRegistry};
pub use registry::{path_to_rpc_method, rpc_method_to_path, Endpoint, EndpointHandler, EndpointRegistry, Protocols};
pub use request::{Transport, WebRequest};
