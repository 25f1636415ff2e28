//! Connection status model
//!
//! Exactly one [`ConnectionStatus`] is current at any instant for a given
//! connection; every externally observable transition carries a
//! [`ConnectionStatusChangeReason`].

use serde::{Deserialize, Serialize};

/// Externally observable connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Not connected: initial state, after a deliberate close, or after a
    /// failure the policy declined to retry
    Disconnected,
    /// First connection attempt in flight
    Connecting,
    /// Connected and ready for operations
    Connected,
    /// Connection lost; the retry policy is attempting to reconnect
    DisconnectedRetrying,
    /// Terminal: retries exhausted or the hub disabled the device
    Disabled,
}

impl ConnectionStatus {
    /// Whether the connection can carry traffic
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// Whether this status is terminal for the connection instance
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Disabled)
    }
}

/// Why the status changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatusChangeReason {
    /// Connection established or re-established
    ConnectionOk,
    /// The application called close()
    ClientClose,
    /// The retry policy gave up
    RetryExpired,
    /// Transport-level communication failure
    CommunicationError,
    /// TLS/certificate/authentication failure
    BadCredential,
    /// Network unreachable or timed out
    NoNetwork,
    /// Server closed the link on request of the fault-injection hook
    FaultInjectedClose,
    /// The hub reports the device disabled or removed
    DeviceDisabled,
}

/// One delivered status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub status: ConnectionStatus,
    pub reason: ConnectionStatusChangeReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_predicate() {
        assert!(ConnectionStatus::Connected.is_connected());
        assert!(!ConnectionStatus::Connecting.is_connected());
        assert!(!ConnectionStatus::DisconnectedRetrying.is_connected());
    }

    #[test]
    fn test_terminal_predicate() {
        assert!(ConnectionStatus::Disabled.is_terminal());
        assert!(!ConnectionStatus::Disconnected.is_terminal());
        assert!(!ConnectionStatus::Connected.is_terminal());
    }

    #[test]
    fn test_status_equality() {
        assert_eq!(ConnectionStatus::Connected, ConnectionStatus::Connected);
        assert_ne!(
            ConnectionStatus::Disconnected,
            ConnectionStatus::DisconnectedRetrying
        );
    }
}
