//! Fault injection hook
//!
//! Resilience tests ask the hub to sever the active connection on demand.
//! The request rides over the data plane as a specially shaped telemetry
//! message: the device sends [`FaultRequest::to_message`] through its open
//! connection, and the scripted transport recognizes the payload and severs
//! the link after the requested delay.

use crate::error::DeviceResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server-side fault operations understood by the hub
pub mod fault_type {
    /// Kill the TCP connection under the session
    pub const KILL_TCP: &str = "KillTcp";
    /// Shut down the AMQP connection gracefully
    pub const SHUTDOWN_AMQP: &str = "ShutDownAmqp";
    /// Shut down the MQTT connection gracefully
    pub const SHUTDOWN_MQTT: &str = "ShutDownMqtt";
    /// Reject with throttling errors for the duration
    pub const THROTTLE: &str = "InvokeThrottling";
    /// Reject with quota-exceeded errors for the duration
    pub const QUOTA_EXCEEDED: &str = "InvokeMaxMessageQuota";
    /// Reject with authorization errors for the duration
    pub const AUTH: &str = "InvokeAuthError";
}

/// Close reason attached to injected faults
pub const FAULT_CLOSE_REASON: &str = "boom";

/// Default pause before the hub applies the fault
pub const DEFAULT_FAULT_DELAY: Duration = Duration::from_secs(5);

/// Default duration the fault stays active
pub const DEFAULT_FAULT_DURATION: Duration = Duration::from_secs(10);

/// One fault injection request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRequest {
    #[serde(rename = "faultType")]
    pub fault_type: String,
    #[serde(rename = "closeReason")]
    pub close_reason: String,
    #[serde(rename = "delayInSecs")]
    pub delay_secs: u64,
    #[serde(rename = "durationInSecs")]
    pub duration_secs: u64,
}

impl FaultRequest {
    pub fn new(fault_type: &str) -> Self {
        Self {
            fault_type: fault_type.to_string(),
            close_reason: FAULT_CLOSE_REASON.to_string(),
            delay_secs: DEFAULT_FAULT_DELAY.as_secs(),
            duration_secs: DEFAULT_FAULT_DURATION.as_secs(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_secs = delay.as_secs();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_secs = duration.as_secs();
        self
    }

    /// Encode as the telemetry payload the hub interprets as a fault command
    pub fn to_message(&self) -> DeviceResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Try to interpret a device-to-cloud payload as a fault command.
/// Ordinary telemetry does not parse and passes through untouched.
pub fn parse_command(payload: &Bytes) -> Option<FaultRequest> {
    match serde_json::from_slice::<FaultRequest>(payload) {
        Ok(request) if !request.fault_type.is_empty() => Some(request),
        _ => None,
    }
}
