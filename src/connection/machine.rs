//! Connection state machine
//!
//! Owns the current status, the attempt counter and the outage clock, and
//! computes every transition. This is the only permitted mutation path for
//! connection status: transport completions are fed in as events, they never
//! write status themselves.

use super::status::{ConnectionStatus, ConnectionStatusChangeReason, StatusChange};
use crate::fault::{ErrorKind, FaultClassification};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::TransportError;
use std::time::{Duration, Instant};

/// Outcome of feeding a transport failure into the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Wait, then attempt to reconnect. `change` is set when the failure is
    /// externally observable (a connected link dropping); initial-connect
    /// retries stay `Connecting` with no observable change.
    RetryScheduled {
        delay: Duration,
        change: Option<StatusChange>,
    },
    /// The policy declined to retry; the connection settles in
    /// `change.status` (`Disconnected`, or terminal `Disabled`).
    GaveUp { change: StatusChange },
}

pub struct ConnectionStateMachine {
    status: ConnectionStatus,
    attempt_count: u32,
    first_failure: Option<Instant>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempt_count: 0,
            first_failure: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Transition into `Connecting` for an open() call. Returns the change
    /// to deliver, or None if an attempt is already in flight (open() is
    /// idempotent while `Connecting`/`Connected`).
    pub fn begin_open(&mut self) -> Option<StatusChange> {
        match self.status {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => None,
            _ => {
                self.status = ConnectionStatus::Connecting;
                Some(StatusChange {
                    status: ConnectionStatus::Connecting,
                    reason: ConnectionStatusChangeReason::ConnectionOk,
                })
            }
        }
    }

    /// A transport connect (or reconnect) completed. Resets the attempt
    /// counter and the outage clock.
    pub fn connect_succeeded(&mut self) -> StatusChange {
        self.status = ConnectionStatus::Connected;
        self.attempt_count = 0;
        self.first_failure = None;
        StatusChange {
            status: ConnectionStatus::Connected,
            reason: ConnectionStatusChangeReason::ConnectionOk,
        }
    }

    /// A transport connect attempt or an established link failed. Consults
    /// the active retry policy and applies the resulting transition.
    pub fn connection_failed(
        &mut self,
        classification: FaultClassification,
        error: &TransportError,
        policy: &RetryPolicy,
    ) -> FailureOutcome {
        self.attempt_count += 1;
        let first_failure = *self.first_failure.get_or_insert_with(Instant::now);
        let elapsed = first_failure.elapsed();

        let decision = policy.should_retry(
            classification.kind,
            classification.is_transient,
            self.attempt_count,
            elapsed,
        );

        match decision {
            RetryDecision::RetryAfter(delay) => {
                let change = match self.status {
                    ConnectionStatus::Connected => {
                        self.status = ConnectionStatus::DisconnectedRetrying;
                        Some(StatusChange {
                            status: ConnectionStatus::DisconnectedRetrying,
                            reason: reason_for(classification.kind, error),
                        })
                    }
                    // Connecting and DisconnectedRetrying keep their
                    // externally observable status across re-attempts
                    _ => None,
                };
                FailureOutcome::RetryScheduled { delay, change }
            }
            RetryDecision::GiveUp => {
                let change = match self.status {
                    ConnectionStatus::DisconnectedRetrying => {
                        self.status = ConnectionStatus::Disabled;
                        StatusChange {
                            status: ConnectionStatus::Disabled,
                            reason: if classification.is_transient {
                                ConnectionStatusChangeReason::RetryExpired
                            } else {
                                reason_for(classification.kind, error)
                            },
                        }
                    }
                    _ => {
                        self.status = ConnectionStatus::Disconnected;
                        StatusChange {
                            status: ConnectionStatus::Disconnected,
                            reason: reason_for(classification.kind, error),
                        }
                    }
                };
                FailureOutcome::GaveUp { change }
            }
        }
    }

    /// Deliberate close. Safe from any state; returns the change to deliver
    /// unless the connection is already settled in `Disconnected`.
    pub fn client_closed(&mut self) -> Option<StatusChange> {
        let was = self.status;
        self.status = ConnectionStatus::Disconnected;
        self.attempt_count = 0;
        self.first_failure = None;
        match was {
            ConnectionStatus::Disconnected => None,
            _ => Some(StatusChange {
                status: ConnectionStatus::Disconnected,
                reason: ConnectionStatusChangeReason::ClientClose,
            }),
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a fault classification onto the reason reported to the observer
pub fn reason_for(kind: ErrorKind, error: &TransportError) -> ConnectionStatusChangeReason {
    match kind {
        ErrorKind::TlsAuthenticationFailure => ConnectionStatusChangeReason::BadCredential,
        ErrorKind::NetworkTimeout => ConnectionStatusChangeReason::NoNetwork,
        ErrorKind::ProtocolError | ErrorKind::Unknown => {
            ConnectionStatusChangeReason::CommunicationError
        }
        ErrorKind::ServerRejected => match error {
            TransportError::Rejected {
                status: 404 | 412, ..
            } => ConnectionStatusChangeReason::DeviceDisabled,
            _ => ConnectionStatusChangeReason::BadCredential,
        },
        ErrorKind::ClientClosed => ConnectionStatusChangeReason::ClientClose,
        ErrorKind::FaultInjected => ConnectionStatusChangeReason::FaultInjectedClose,
    }
}
