//! Status change notification
//!
//! One registered observer per connection, last registration wins. The
//! notifier suppresses consecutive duplicate statuses and shields the state
//! machine from panicking handlers: the transition is committed before the
//! handler runs, so a panic cannot corrupt internal state.

use super::status::{ConnectionStatus, ConnectionStatusChangeReason};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

/// Observer callback for status transitions
pub type StatusHandler = Box<dyn FnMut(ConnectionStatus, ConnectionStatusChangeReason) + Send>;

pub struct StatusNotifier {
    handler: Option<StatusHandler>,
    last_delivered: Option<ConnectionStatus>,
    muted: bool,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self {
            handler: None,
            last_delivered: None,
            muted: false,
        }
    }

    /// Register the observer. Replaces any previous registration.
    pub fn set_handler(&mut self, handler: StatusHandler) {
        self.handler = Some(handler);
    }

    /// Deliver a transition to the observer, once per distinct status.
    /// Returns true if the transition was delivered.
    pub fn notify(&mut self, status: ConnectionStatus, reason: ConnectionStatusChangeReason) -> bool {
        if self.muted {
            return false;
        }
        if self.last_delivered == Some(status) {
            debug!(?status, "suppressing duplicate status notification");
            return false;
        }

        // Commit before invoking: a panicking handler must not be able to
        // roll the notifier back into re-delivering the same status.
        self.last_delivered = Some(status);

        if let Some(handler) = self.handler.as_mut() {
            let result = catch_unwind(AssertUnwindSafe(|| handler(status, reason)));
            if result.is_err() {
                warn!(?status, ?reason, "status change handler panicked");
            }
        }
        true
    }

    /// Silence the notifier. Called on close(); no notification may be
    /// emitted after close() returns.
    pub fn mute(&mut self) {
        self.muted = true;
    }

    /// Re-enable delivery for a client that is being reopened
    pub fn unmute(&mut self) {
        self.muted = false;
    }

    /// Last status delivered to the observer, if any
    pub fn last_delivered(&self) -> Option<ConnectionStatus> {
        self.last_delivered
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}
