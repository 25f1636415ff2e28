//! Scripted transport and in-memory hub for tests
//!
//! [`ScriptedTransportControl`] plays the hub side of a connection: tests
//! queue connect outcomes, deliver device-bound messages, and sever the
//! active link mid-session. [`InMemoryHub`] implements the registry surface
//! with real partial-success semantics.

use super::fault_injection::{self, FaultRequest};
use crate::connection::TransportFactory;
use crate::error::{DeviceError, DeviceResult};
use crate::registry::{
    apply_update, BulkRegistryOperationResult, DeviceRegistryOperationError, RegistryApi, Twin,
};
use crate::transport::{TransportBinding, TransportError, TransportEvent, TransportKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Buildable description of a transport error. [`TransportError`] is not
/// `Clone`, so scripts store the recipe and build on demand.
#[derive(Debug, Clone)]
pub enum ErrorSpec {
    Timeout,
    TlsAuthFailure,
    ConnectionReset,
    Rejected { status: u16, permanent: bool },
    ServerClosed { reason: String },
    FaultInjected { fault_type: String, reason: String },
}

impl ErrorSpec {
    pub fn build(&self) -> TransportError {
        match self {
            ErrorSpec::Timeout => TransportError::Timeout {
                operation: "scripted connect".to_string(),
            },
            ErrorSpec::TlsAuthFailure => TransportError::Tls {
                message: "invalid peer certificate: UnknownIssuer".to_string(),
                source: None,
            },
            ErrorSpec::ConnectionReset => TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )),
            ErrorSpec::Rejected { status, permanent } => TransportError::Rejected {
                status: *status,
                permanent: *permanent,
                message: format!("scripted rejection {status}"),
            },
            ErrorSpec::ServerClosed { reason } => TransportError::ServerClosed {
                reason: reason.clone(),
            },
            ErrorSpec::FaultInjected { fault_type, reason } => TransportError::FaultInjected {
                fault_type: fault_type.clone(),
                reason: reason.clone(),
            },
        }
    }
}

enum LinkEvent {
    Message(Bytes),
    Drop(ErrorSpec),
}

struct ScriptState {
    connect_outcomes: VecDeque<ErrorSpec>,
    connect_count: u32,
    sent: Vec<Bytes>,
    link: Option<mpsc::UnboundedSender<LinkEvent>>,
}

/// Test-side handle to the scripted transport
#[derive(Clone)]
pub struct ScriptedTransportControl {
    inner: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransportControl {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScriptState {
                connect_outcomes: VecDeque::new(),
                connect_count: 0,
                sent: Vec::new(),
                link: None,
            })),
        }
    }

    /// Queue a failure for the next connect attempt. Attempts with no queued
    /// failure succeed.
    pub fn fail_next_connect(&self, spec: ErrorSpec) {
        self.inner.lock().unwrap().connect_outcomes.push_back(spec);
    }

    pub fn fail_next_connects(&self, count: u32, spec: ErrorSpec) {
        let mut state = self.inner.lock().unwrap();
        for _ in 0..count {
            state.connect_outcomes.push_back(spec.clone());
        }
    }

    /// Deliver a device-bound message over the active link
    pub fn deliver_message(&self, payload: Bytes) {
        if let Some(link) = &self.inner.lock().unwrap().link {
            let _ = link.send(LinkEvent::Message(payload));
        }
    }

    /// Sever the active link with the given error
    pub fn drop_link(&self, spec: ErrorSpec) {
        if let Some(link) = self.inner.lock().unwrap().link.take() {
            let _ = link.send(LinkEvent::Drop(spec));
        }
    }

    /// Honor a fault command that arrived over the data plane: after the
    /// request's delay, sever the active link with a fault-injected close.
    fn schedule_fault(&self, request: FaultRequest) {
        let control = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(request.delay_secs)).await;
            info!(fault_type = %request.fault_type, "applying injected fault");
            control.drop_link(ErrorSpec::FaultInjected {
                fault_type: request.fault_type,
                reason: request.close_reason,
            });
        });
    }

    /// Sever the active link the way the hub does when a second connection
    /// for the same device identity takes over the session
    pub fn kick(&self) {
        self.drop_link(ErrorSpec::ServerClosed {
            reason: "another session for this identity took over".to_string(),
        });
    }

    pub fn connect_count(&self) -> u32 {
        self.inner.lock().unwrap().connect_count
    }

    pub fn has_active_link(&self) -> bool {
        self.inner.lock().unwrap().link.is_some()
    }

    /// All device-to-cloud payloads accepted so far
    pub fn sent_events(&self) -> Vec<Bytes> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Transport factory handing one scripted binding per connect attempt
    pub fn factory(&self) -> TransportFactory {
        let control = self.clone();
        Box::new(move || {
            Box::new(ScriptedTransport {
                control: control.clone(),
                rx: None,
            })
        })
    }
}

impl Default for ScriptedTransportControl {
    fn default() -> Self {
        Self::new()
    }
}

struct ScriptedTransport {
    control: ScriptedTransportControl,
    rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

#[async_trait]
impl TransportBinding for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::MqttTcp
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.control.inner.lock().unwrap();
        state.connect_count += 1;
        if let Some(spec) = state.connect_outcomes.pop_front() {
            return Err(spec.build());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.link = Some(tx);
        drop(state);
        self.rx = Some(rx);
        Ok(())
    }

    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        if self.rx.is_none() {
            return Err(TransportError::NotConnected);
        }
        // The hub interprets fault commands carried on the data plane
        if let Some(request) = fault_injection::parse_command(&payload) {
            self.control.schedule_fault(request);
        }
        self.control.inner.lock().unwrap().sent.push(payload);
        Ok(())
    }

    async fn recv(&mut self) -> Result<TransportEvent, TransportError> {
        let rx = self.rx.as_mut().ok_or(TransportError::NotConnected)?;
        match rx.recv().await {
            Some(LinkEvent::Message(payload)) => Ok(TransportEvent::Message(payload)),
            Some(LinkEvent::Drop(spec)) => Err(spec.build()),
            // Sender gone: a newer session replaced this link
            None => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "link replaced",
            ))),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.rx = None;
        Ok(())
    }
}

/// In-memory registry with hub bulk-update semantics: items that can be
/// applied are applied, items that cannot become per-item errors, and only
/// the batch itself failing would be an `Err`.
pub struct InMemoryHub {
    twins: Mutex<HashMap<String, Twin>>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self {
            twins: Mutex::new(HashMap::new()),
        }
    }

    /// Register a device identity with an empty twin
    pub fn register(&self, device_id: impl Into<String>) {
        let device_id = device_id.into();
        self.twins
            .lock()
            .unwrap()
            .insert(device_id.clone(), Twin::new(device_id));
    }

    pub fn device_count(&self) -> usize {
        self.twins.lock().unwrap().len()
    }
}

impl Default for InMemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryApi for InMemoryHub {
    async fn get_twin(&self, device_id: &str) -> DeviceResult<Twin> {
        self.twins
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| {
                DeviceError::Transport(TransportError::Rejected {
                    status: 404,
                    permanent: true,
                    message: format!("device {device_id} is not registered"),
                })
            })
    }

    async fn update_twins_bulk(
        &self,
        twins: Vec<Twin>,
        force_replace: bool,
    ) -> DeviceResult<BulkRegistryOperationResult> {
        let mut registered = self.twins.lock().unwrap();
        let mut errors = Vec::new();
        for update in twins {
            match registered.get_mut(&update.device_id) {
                Some(existing) => apply_update(existing, &update, force_replace),
                None => errors.push(DeviceRegistryOperationError {
                    device_id: update.device_id.clone(),
                    error_code: "DeviceNotFound".to_string(),
                    error_status: format!("device {} is not registered", update.device_id),
                }),
            }
        }
        Ok(BulkRegistryOperationResult::with_errors(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_connect_outcomes_in_order() {
        let control = ScriptedTransportControl::new();
        control.fail_next_connect(ErrorSpec::Timeout);

        let mut factory = control.factory();
        let mut first = factory();
        assert!(matches!(
            first.connect().await,
            Err(TransportError::Timeout { .. })
        ));

        let mut second = factory();
        second.connect().await.unwrap();
        assert_eq!(control.connect_count(), 2);
        assert!(control.has_active_link());
    }

    #[tokio::test]
    async fn test_scripted_link_drop_surfaces_on_recv() {
        let control = ScriptedTransportControl::new();
        let mut factory = control.factory();
        let mut binding = factory();
        binding.connect().await.unwrap();

        control.drop_link(ErrorSpec::ConnectionReset);
        assert!(matches!(
            binding.recv().await,
            Err(TransportError::Io(_))
        ));
        assert!(!control.has_active_link());
    }

    #[tokio::test]
    async fn test_scripted_message_delivery_and_send_capture() {
        let control = ScriptedTransportControl::new();
        let mut factory = control.factory();
        let mut binding = factory();
        binding.connect().await.unwrap();

        control.deliver_message(Bytes::from_static(b"hi"));
        let TransportEvent::Message(payload) = binding.recv().await.unwrap();
        assert_eq!(&payload[..], b"hi");

        binding.send(Bytes::from_static(b"{\"t\":1}")).await.unwrap();
        assert_eq!(control.sent_events().len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_hub_partial_success() {
        let hub = InMemoryHub::new();
        hub.register("dev-01");

        let updates = vec![
            Twin::new("dev-01").with_tag("zone", serde_json::json!("a")),
            Twin::new("ghost"),
        ];
        let result = hub.update_twins_bulk(updates, false).await.unwrap();
        assert!(!result.is_successful);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].device_id, "ghost");

        // The valid update was still applied
        let twin = hub.get_twin("dev-01").await.unwrap();
        assert_eq!(twin.tags["zone"], serde_json::json!("a"));
    }
}
