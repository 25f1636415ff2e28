//! Connection lifecycle: status model, state machine, notifier, supervisor

pub mod machine;
pub mod manager;
pub mod notifier;
pub mod status;

pub use manager::{DeviceClient, TransportFactory};
pub use notifier::{StatusHandler, StatusNotifier};
pub use status::{ConnectionStatus, ConnectionStatusChangeReason, StatusChange};
