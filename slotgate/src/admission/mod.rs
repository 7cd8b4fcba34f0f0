//! Admission control in front of the backend.
//!
//! Two distinct bounds apply to every request:
//! - the slot pool is the hard limit on requests forwarded at once
//! - the concurrency counter, checked against the policy ceiling, is the soft
//!   limit on requests admitted for consideration (forwarding or queued)

mod controller;
mod counter;
mod policy;
mod pool;

pub use controller::{AdmissionController, AdmissionError, GateStats};
pub use counter::{ConcurrencyCounter, CounterTicket};
pub use policy::{OvercapacityPolicy, PolicyKind, UnknownPolicy};
pub use pool::{SlotId, SlotPermit, SlotPool};
