//! Printer-host connection, RPC multiplexing and session state (spec
//! §3 "Printer-host connection", §4.2-§4.4).

pub mod connection;
pub mod rpc;
pub mod session;
pub mod transport;

pub use connection::HostConnection;
pub use rpc::{PendingTable, RemoteMethodHandler, RemoteMethodRegistry, RpcResult};
pub use session::{HostState, InitStep};
