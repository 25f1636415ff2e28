//! hublink - IoT hub device SDK connection core
//!
//! Connection resilience for device-to-hub links: a supervised connection
//! state machine, pluggable retry policies, fault classification, and
//! transport bindings for AMQP, MQTT and HTTP (with WebSocket-tunneled
//! variants).
//!
//! # Overview
//!
//! This crate provides:
//! - A device client with observable connection status transitions
//! - Retry policies (none, fixed interval, exponential backoff with jitter)
//! - A fault classifier that walks error cause chains
//! - Transport bindings over rumqttc, raw TCP and reqwest
//! - Service-side direct methods and bulk twin registry operations
//!
//! # Quick Start
//!
//! ```no_run
//! use hublink::config::DeviceConfig;
//! use hublink::connection::{ConnectionStatus, DeviceClient};
//!
//! # async fn example() -> hublink::DeviceResult<()> {
//! let config = DeviceConfig::load_from_str(
//!     r#"
//! [device]
//! id = "dev-01"
//!
//! [hub]
//! hostname = "hub.example.net"
//!
//! [transport]
//! kind = "mqtt-tcp"
//! "#,
//! )?;
//!
//! let mut client = DeviceClient::from_config(&config)?;
//! client.on_status_change(|status, reason| {
//!     println!("{status:?} ({reason:?})");
//! });
//!
//! client.open().await?;
//! assert_eq!(client.status(), ConnectionStatus::Connected);
//! client.send_event(&b"{\"temperature\": 21.5}"[..]).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod fault;
pub mod method;
pub mod observability;
pub mod registry;
pub mod retry;
pub mod testing;
pub mod transport;

pub use config::DeviceConfig;
pub use connection::{ConnectionStatus, ConnectionStatusChangeReason, DeviceClient};
pub use error::{DeviceError, DeviceResult};
pub use fault::{classify, ErrorKind, FaultClassification};
pub use method::{MethodClient, MethodInvocation, MethodResult};
pub use registry::{BulkRegistryOperationResult, RegistryApi, RegistryClient, Twin};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{TransportBinding, TransportError, TransportKind};
