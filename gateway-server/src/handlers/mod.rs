//! Endpoint handler bodies, one module per route group.

pub mod access;
pub mod files;
pub mod server_info;
pub mod subscribe;
