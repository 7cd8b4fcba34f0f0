//! Transport layer for slotgate.
//!
//! Currently provides HTTP transport via axum.

pub mod http;

pub use http::{GateState, ServerConfig, serve, serve_with_listener};
