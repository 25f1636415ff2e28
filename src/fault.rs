//! Fault classification for raw transport errors
//!
//! Maps a [`TransportError`] into a semantic error kind plus a
//! transient/non-transient judgment. TLS and authentication failures arrive
//! wrapped at varying depth depending on the transport (a WebSocket upgrade
//! failure may wrap a TLS cause, which may wrap an I/O cause), so
//! classification walks the entire `source()` chain rather than assuming a
//! fixed depth.

use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::io;

/// Semantic category of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Network-level failure expected to clear on its own
    NetworkTimeout,
    /// TLS negotiation or certificate/authentication failure - never retried
    TlsAuthenticationFailure,
    /// Post-handshake protocol failure (malformed frame, server busy, kick)
    ProtocolError,
    /// Server rejected the request outright
    ServerRejected,
    /// Deliberate client-side close - not a fault
    ClientClosed,
    /// Server closed the connection on request of the fault-injection hook
    FaultInjected,
    /// Anything we could not categorize
    Unknown,
}

/// Classification result: semantic kind plus retryability judgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultClassification {
    pub kind: ErrorKind,
    pub is_transient: bool,
}

impl FaultClassification {
    fn transient(kind: ErrorKind) -> Self {
        Self {
            kind,
            is_transient: true,
        }
    }

    fn terminal(kind: ErrorKind) -> Self {
        Self {
            kind,
            is_transient: false,
        }
    }
}

/// Classify a raw transport error
pub fn classify(error: &TransportError) -> FaultClassification {
    match error {
        TransportError::Tls { .. } => {
            FaultClassification::terminal(ErrorKind::TlsAuthenticationFailure)
        }

        // Upgrade failures inherit the classification of what broke the
        // upgrade; a TLS cause buried in the chain must win.
        TransportError::WebSocketUpgrade { source } => {
            if chain_has_tls_marker(error) {
                FaultClassification::terminal(ErrorKind::TlsAuthenticationFailure)
            } else {
                let inner = classify(source);
                match inner.kind {
                    ErrorKind::Unknown => FaultClassification::transient(ErrorKind::ProtocolError),
                    _ => inner,
                }
            }
        }

        TransportError::Io(io_err) => classify_io(io_err),

        TransportError::Timeout { .. } => FaultClassification::transient(ErrorKind::NetworkTimeout),

        TransportError::Rejected { permanent, .. } => FaultClassification {
            kind: ErrorKind::ServerRejected,
            is_transient: !permanent,
        },

        TransportError::Protocol { .. } => {
            if chain_has_tls_marker(error) {
                FaultClassification::terminal(ErrorKind::TlsAuthenticationFailure)
            } else if chain_has_timeout(error) {
                FaultClassification::transient(ErrorKind::NetworkTimeout)
            } else {
                FaultClassification::transient(ErrorKind::ProtocolError)
            }
        }

        TransportError::ServerClosed { .. } => {
            FaultClassification::transient(ErrorKind::ProtocolError)
        }

        TransportError::FaultInjected { .. } => {
            FaultClassification::transient(ErrorKind::FaultInjected)
        }

        TransportError::NotConnected => FaultClassification::terminal(ErrorKind::ClientClosed),

        TransportError::InvalidEndpoint(_) => {
            FaultClassification::terminal(ErrorKind::ProtocolError)
        }
    }
}

fn classify_io(err: &io::Error) -> FaultClassification {
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => FaultClassification::transient(ErrorKind::NetworkTimeout),
        io::ErrorKind::PermissionDenied => {
            // rustls surfaces certificate rejections as InvalidData or
            // PermissionDenied depending on the layer that caught them
            if chain_has_tls_marker(err) {
                FaultClassification::terminal(ErrorKind::TlsAuthenticationFailure)
            } else {
                FaultClassification::terminal(ErrorKind::ServerRejected)
            }
        }
        io::ErrorKind::InvalidData => {
            if chain_has_tls_marker(err) {
                FaultClassification::terminal(ErrorKind::TlsAuthenticationFailure)
            } else {
                FaultClassification::transient(ErrorKind::ProtocolError)
            }
        }
        _ => {
            if chain_has_tls_marker(err) {
                FaultClassification::terminal(ErrorKind::TlsAuthenticationFailure)
            } else {
                FaultClassification::transient(ErrorKind::Unknown)
            }
        }
    }
}

const TLS_MARKERS: &[&str] = &[
    "certificate",
    "tls",
    "ssl",
    "handshake",
    "authentication",
    "bad record mac",
    "unknown issuer",
];

/// Walk the full cause chain looking for TLS/authentication markers.
/// Depth is environment-dependent; never assume a fixed level.
fn chain_has_tls_marker(error: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        let text = err.to_string().to_lowercase();
        if TLS_MARKERS.iter().any(|marker| text.contains(marker)) {
            return true;
        }
        current = err.source();
    }
    false
}

fn chain_has_timeout(error: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return true;
            }
        }
        if err.to_string().to_lowercase().contains("timed out") {
            return true;
        }
        current = err.source();
    }
    false
}
