//! slotgate: bounded-concurrency admission gate in front of a single HTTP backend.

pub mod admission;
pub mod config;
pub mod forwarder;
pub mod halt;
pub mod transport;

pub use admission::{AdmissionController, AdmissionError, GateStats, OvercapacityPolicy};
pub use config::{ConfigError, GateConfig};
pub use forwarder::{ForwardError, Forwarder, ProxyForwarder};
pub use halt::{ExitProcess, Halt};
