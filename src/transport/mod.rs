//! Transport layer for device-to-hub communication
//!
//! One [`TransportBinding`] implementation per protocol family. Bindings own
//! the physical connection and report transport-level events upward; they
//! never touch connection status themselves - the connection supervisor is
//! the only component allowed to do that.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod amqp;
pub mod http;
pub mod mqtt;
pub mod settings;

pub use settings::TransportSettings;

/// Protocol variant for a device connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    AmqpTcp,
    #[serde(rename = "amqp-websocket")]
    AmqpWebSocket,
    #[default]
    MqttTcp,
    #[serde(rename = "mqtt-websocket")]
    MqttWebSocket,
    Http,
}

impl TransportKind {
    /// Default port for the protocol variant
    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::AmqpTcp => 5671,
            TransportKind::AmqpWebSocket => 443,
            TransportKind::MqttTcp => 8883,
            TransportKind::MqttWebSocket => 443,
            TransportKind::Http => 443,
        }
    }

    /// Whether the variant tunnels through a WebSocket upgrade
    pub fn is_websocket(&self) -> bool {
        matches!(
            self,
            TransportKind::AmqpWebSocket | TransportKind::MqttWebSocket
        )
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::AmqpTcp => "amqp-tcp",
            TransportKind::AmqpWebSocket => "amqp-websocket",
            TransportKind::MqttTcp => "mqtt-tcp",
            TransportKind::MqttWebSocket => "mqtt-websocket",
            TransportKind::Http => "http",
        };
        f.write_str(name)
    }
}

/// Inbound event surfaced by a binding
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A hub-to-device message (telemetry ack, method request envelope, ...)
    Message(Bytes),
}

/// Transport-level errors
///
/// Variants keep their underlying causes so the fault classifier can walk
/// the full source chain; the wrapping depth varies by protocol.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("TLS negotiation failed: {message}")]
    Tls {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("WebSocket upgrade failed")]
    WebSocketUpgrade {
        #[source]
        source: Box<TransportError>,
    },

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("server rejected request with status {status}: {message}")]
    Rejected {
        status: u16,
        permanent: bool,
        message: String,
    },

    #[error("protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("connection closed by server: {reason}")]
    ServerClosed { reason: String },

    #[error("connection closed by fault injection ({fault_type}): {reason}")]
    FaultInjected { fault_type: String, reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl TransportError {
    /// Convenience constructor for protocol errors wrapping a cause
    pub fn protocol<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TransportError::Protocol {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Protocol error without an underlying cause
    pub fn protocol_msg(message: impl Into<String>) -> Self {
        TransportError::Protocol {
            message: message.into(),
            source: None,
        }
    }
}

/// Transport binding contract: one physical connection per instance, at most
/// one outstanding connect attempt at a time.
#[async_trait::async_trait]
pub trait TransportBinding: Send {
    /// Protocol variant implemented by this binding
    fn kind(&self) -> TransportKind;

    /// Open the physical connection. Completes only once the server has
    /// acknowledged the session (or fails with the raw transport error).
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Send one device-to-cloud payload over the open connection
    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError>;

    /// Wait for the next inbound event. Returns `Err` when the link drops;
    /// the error carries the cause the classifier needs.
    async fn recv(&mut self) -> Result<TransportEvent, TransportError>;

    /// Release all sockets and handles
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Construct the binding for the configured protocol variant
pub fn bind(settings: TransportSettings) -> Box<dyn TransportBinding> {
    match settings.kind {
        TransportKind::MqttTcp | TransportKind::MqttWebSocket => {
            Box::new(mqtt::MqttBinding::new(settings))
        }
        TransportKind::AmqpTcp | TransportKind::AmqpWebSocket => {
            Box::new(amqp::AmqpBinding::new(settings))
        }
        TransportKind::Http => Box::new(http::HttpBinding::new(settings)),
    }
}
