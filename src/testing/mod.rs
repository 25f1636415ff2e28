//! Test doubles and fault injection helpers
//!
//! Compiled into the library so integration tests and downstream consumers
//! can drive the connection supervisor without a live hub.

pub mod fault_injection;
pub mod mocks;

pub use fault_injection::{fault_type, FaultRequest, FAULT_CLOSE_REASON};
pub use mocks::{ErrorSpec, InMemoryHub, ScriptedTransportControl};
