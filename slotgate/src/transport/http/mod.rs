//! HTTP transport.

mod routes;
mod server;

pub use routes::{GateState, routes};
pub use server::{ServerConfig, serve, serve_with_listener};
