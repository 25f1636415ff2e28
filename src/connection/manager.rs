//! Connection supervisor and device client
//!
//! [`DeviceClient`] is the application-facing handle. All connection work
//! runs on a supervisor task that owns the transport binding, the state
//! machine and the notifier; the handle talks to it over channels. Status is
//! mirrored into a `watch` channel so callers can await transitions without
//! registering a callback.

use super::machine::{ConnectionStateMachine, FailureOutcome};
use super::notifier::{StatusHandler, StatusNotifier};
use super::status::{ConnectionStatus, ConnectionStatusChangeReason, StatusChange};
use crate::config::DeviceConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::fault::{classify, FaultClassification};
use crate::method::{self, MethodDispatcher, MethodHandler, MethodInvocation, MethodResponseEnvelope};
use crate::retry::RetryPolicy;
use crate::transport::{self, TransportBinding, TransportError, TransportEvent, TransportSettings};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Produces a fresh transport binding for each connection attempt
pub type TransportFactory = Box<dyn FnMut() -> Box<dyn TransportBinding> + Send>;

enum Command {
    SendEvent {
        payload: Bytes,
        reply: oneshot::Sender<DeviceResult<()>>,
    },
    SetRetryPolicy(RetryPolicy),
    SetStatusHandler(StatusHandler),
    SetMethodHandler {
        // None registers the default handler
        name: Option<String>,
        handler: MethodHandler,
    },
}

/// State shared between runs of the supervisor. Handed back to the client
/// when the supervisor exits so handlers and policy survive a close/reopen
/// cycle.
struct Core {
    factory: TransportFactory,
    policy: RetryPolicy,
    notifier: StatusNotifier,
    methods: MethodDispatcher,
    status_tx: watch::Sender<ConnectionStatus>,
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Core>,
}

/// Device-to-hub connection handle
pub struct DeviceClient {
    idle: Option<Core>,
    running: Option<Running>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl DeviceClient {
    /// Build a client from configuration, binding the configured transport
    pub fn from_config(config: &DeviceConfig) -> DeviceResult<Self> {
        let settings = TransportSettings::from_config(config)?;
        let policy = config.retry_policy();
        Ok(Self::with_transport(
            Box::new(move || transport::bind(settings.clone())),
            policy,
        ))
    }

    /// Build a client around an arbitrary transport factory
    pub fn with_transport(factory: TransportFactory, policy: RetryPolicy) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            idle: Some(Core {
                factory,
                policy,
                notifier: StatusNotifier::new(),
                methods: MethodDispatcher::new(),
                status_tx,
            }),
            running: None,
            status_rx,
        }
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Watch channel mirroring every status transition
    pub fn status_updates(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Register the status change observer. Replaces any previous handler;
    /// register before `open()` to observe the initial `Connecting`.
    pub fn on_status_change<F>(&mut self, handler: F)
    where
        F: FnMut(ConnectionStatus, ConnectionStatusChangeReason) + Send + 'static,
    {
        if let Some(core) = self.idle.as_mut() {
            core.notifier.set_handler(Box::new(handler));
        } else if let Some(running) = &self.running {
            let _ = running
                .commands
                .send(Command::SetStatusHandler(Box::new(handler)));
        }
    }

    /// Swap the retry policy. Takes effect on the next retry evaluation; a
    /// backoff already in progress is not re-planned.
    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        if let Some(core) = self.idle.as_mut() {
            core.policy = policy;
        } else if let Some(running) = &self.running {
            let _ = running.commands.send(Command::SetRetryPolicy(policy));
        }
    }

    /// Register the device-side handler for one direct method name.
    /// Replaces any previous registration for that name.
    pub fn set_method_handler<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: FnMut(MethodInvocation) -> method::MethodResult + Send + 'static,
    {
        let name = name.into();
        if let Some(core) = self.idle.as_mut() {
            core.methods.set_handler(name, Box::new(handler));
        } else if let Some(running) = &self.running {
            let _ = running.commands.send(Command::SetMethodHandler {
                name: Some(name),
                handler: Box::new(handler),
            });
        }
    }

    /// Register the fallback handler for methods without a named handler
    pub fn set_default_method_handler<F>(&mut self, handler: F)
    where
        F: FnMut(MethodInvocation) -> method::MethodResult + Send + 'static,
    {
        if let Some(core) = self.idle.as_mut() {
            core.methods.set_default_handler(Box::new(handler));
        } else if let Some(running) = &self.running {
            let _ = running.commands.send(Command::SetMethodHandler {
                name: None,
                handler: Box::new(handler),
            });
        }
    }

    /// Open the connection, driving the initial connect (and any retries the
    /// active policy allows) to completion. Idempotent while a connection is
    /// in flight or established.
    pub async fn open(&mut self) -> DeviceResult<()> {
        if self.running.is_some() {
            match self.status() {
                ConnectionStatus::Connecting | ConnectionStatus::Connected => return Ok(()),
                _ => self.reclaim().await?,
            }
        }

        if self.status() == ConnectionStatus::Disabled {
            // Terminal for this connection instance
            return Err(DeviceError::NotOpen {
                status: ConnectionStatus::Disabled,
            });
        }

        let mut core = self.idle.take().ok_or(DeviceError::ClientClosed)?;
        core.notifier.unmute();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let supervisor = Supervisor {
            core,
            machine: ConnectionStateMachine::new(),
            commands: command_rx,
            shutdown: shutdown_rx,
            ready: Some(ready_tx),
        };
        let handle = tokio::spawn(supervisor.run());
        self.running = Some(Running {
            commands: command_tx,
            shutdown: shutdown_tx,
            handle,
        });

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::ClientClosed),
        }
    }

    /// Close the connection. Cancels any pending retry, delivers the final
    /// `Disconnected`/`ClientClose` notification, and guarantees no further
    /// notifications once this returns. Safe to call from any state.
    pub async fn close(&mut self) -> DeviceResult<()> {
        self.reclaim().await
    }

    /// Send one device-to-cloud event over the open connection
    pub async fn send_event(&self, payload: impl Into<Bytes>) -> DeviceResult<()> {
        let running = self.running.as_ref().ok_or(DeviceError::NotOpen {
            status: self.status(),
        })?;
        let (reply_tx, reply_rx) = oneshot::channel();
        running
            .commands
            .send(Command::SendEvent {
                payload: payload.into(),
                reply: reply_tx,
            })
            .map_err(|_| DeviceError::NotOpen {
                status: self.status(),
            })?;
        reply_rx.await.map_err(|_| DeviceError::ClientClosed)?
    }

    /// Stop the supervisor (if any) and take its state back
    async fn reclaim(&mut self) -> DeviceResult<()> {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            let core = running
                .handle
                .await
                .map_err(|_| DeviceError::ClientClosed)?;
            self.idle = Some(core);
        }
        Ok(())
    }
}

/// Owns the transport and the state machine for one open() lifetime
struct Supervisor {
    core: Core,
    machine: ConnectionStateMachine,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    ready: Option<oneshot::Sender<DeviceResult<()>>>,
}

enum ConnectStep {
    Shutdown,
    Done(Result<(), TransportError>),
}

enum SessionStep {
    Shutdown,
    Command(Option<Command>),
    Inbound(Result<TransportEvent, TransportError>),
}

enum BackoffStep {
    Shutdown,
    Elapsed,
    Command(Option<Command>),
}

impl Supervisor {
    async fn run(mut self) -> Core {
        if let Some(change) = self.machine.begin_open() {
            self.apply(&change);
        }

        loop {
            let mut binding = match self.connect_phase().await {
                ConnectPhase::Connected(binding) => binding,
                ConnectPhase::Closed => return self.finish_closed(),
                ConnectPhase::Settled => return self.core,
            };

            match self.session_phase(binding.as_mut()).await {
                SessionEnd::Closed => {
                    let _ = binding.close().await;
                    return self.finish_closed();
                }
                SessionEnd::Dropped(error) => {
                    let _ = binding.close().await;
                    drop(binding);
                    match self.handle_failure(error) {
                        FailureStep::Retry(delay) => {
                            if !self.backoff(delay).await {
                                return self.finish_closed();
                            }
                        }
                        FailureStep::Settled => return self.core,
                    }
                }
            }
        }
    }

    /// Attempt to connect, honoring the retry policy, until connected,
    /// settled (gave up) or shut down.
    async fn connect_phase(&mut self) -> ConnectPhase {
        loop {
            if *self.shutdown.borrow() {
                return ConnectPhase::Closed;
            }

            let mut candidate = (self.core.factory)();
            let step = tokio::select! {
                _ = self.shutdown.changed() => ConnectStep::Shutdown,
                result = candidate.connect() => ConnectStep::Done(result),
            };

            match step {
                ConnectStep::Shutdown => return ConnectPhase::Closed,
                ConnectStep::Done(Ok(())) => {
                    let change = self.machine.connect_succeeded();
                    self.apply(&change);
                    if let Some(ready) = self.ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                    return ConnectPhase::Connected(candidate);
                }
                ConnectStep::Done(Err(error)) => match self.handle_failure(error) {
                    FailureStep::Retry(delay) => {
                        if !self.backoff(delay).await {
                            return ConnectPhase::Closed;
                        }
                    }
                    FailureStep::Settled => return ConnectPhase::Settled,
                },
            }
        }
    }

    /// Pump the established connection: commands out, inbound events in
    async fn session_phase(&mut self, binding: &mut dyn TransportBinding) -> SessionEnd {
        loop {
            let step = tokio::select! {
                _ = self.shutdown.changed() => SessionStep::Shutdown,
                cmd = self.commands.recv() => SessionStep::Command(cmd),
                result = binding.recv() => SessionStep::Inbound(result),
            };

            match step {
                SessionStep::Shutdown | SessionStep::Command(None) => return SessionEnd::Closed,
                SessionStep::Command(Some(command)) => {
                    self.handle_command(command, binding).await;
                }
                SessionStep::Inbound(Ok(TransportEvent::Message(payload))) => {
                    self.handle_message(payload, binding).await;
                }
                SessionStep::Inbound(Err(error)) => return SessionEnd::Dropped(error),
            }
        }
    }

    /// Feed a connection failure through the state machine and the policy
    fn handle_failure(&mut self, error: TransportError) -> FailureStep {
        let classification = classify(&error);
        warn!(
            kind = ?classification.kind,
            transient = classification.is_transient,
            attempt = self.machine.attempt_count() + 1,
            error = %error,
            "connection failure"
        );

        match self
            .machine
            .connection_failed(classification, &error, &self.core.policy)
        {
            FailureOutcome::RetryScheduled { delay, change } => {
                if let Some(change) = change {
                    self.apply(&change);
                }
                info!(delay = ?delay, "reconnect scheduled");
                FailureStep::Retry(delay)
            }
            FailureOutcome::GaveUp { change } => {
                self.apply(&change);
                let give_up = give_up_error(classification, self.machine.attempt_count(), error);
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Err(give_up));
                } else {
                    error!(error = %give_up, "connection lost and not recovered");
                }
                FailureStep::Settled
            }
        }
    }

    /// Wait out a retry delay while still answering commands. Returns false
    /// if shut down during the wait; the pending reconnect is abandoned.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            let step = tokio::select! {
                _ = self.shutdown.changed() => BackoffStep::Shutdown,
                _ = &mut sleep => BackoffStep::Elapsed,
                cmd = self.commands.recv() => BackoffStep::Command(cmd),
            };
            match step {
                BackoffStep::Shutdown | BackoffStep::Command(None) => return false,
                BackoffStep::Elapsed => return true,
                BackoffStep::Command(Some(Command::SendEvent { reply, .. })) => {
                    let _ = reply.send(Err(DeviceError::NotOpen {
                        status: self.machine.status(),
                    }));
                }
                BackoffStep::Command(Some(command)) => self.handle_control(command),
            }
        }
    }

    async fn handle_command(&mut self, command: Command, binding: &mut dyn TransportBinding) {
        match command {
            Command::SendEvent { payload, reply } => {
                let result = binding.send(payload).await.map_err(DeviceError::from);
                let _ = reply.send(result);
            }
            other => self.handle_control(other),
        }
    }

    fn handle_control(&mut self, command: Command) {
        match command {
            Command::SetRetryPolicy(policy) => {
                debug!(?policy, "retry policy replaced");
                self.core.policy = policy;
            }
            Command::SetStatusHandler(handler) => self.core.notifier.set_handler(handler),
            Command::SetMethodHandler {
                name: Some(name),
                handler,
            } => self.core.methods.set_handler(name, handler),
            Command::SetMethodHandler {
                name: None,
                handler,
            } => self.core.methods.set_default_handler(handler),
            Command::SendEvent { reply, .. } => {
                let _ = reply.send(Err(DeviceError::NotOpen {
                    status: self.machine.status(),
                }));
            }
        }
    }

    /// Dispatch one inbound payload: method request or plain device-bound
    /// message.
    async fn handle_message(&mut self, payload: Bytes, binding: &mut dyn TransportBinding) {
        let Some(request) = method::parse_request(&payload) else {
            debug!(len = payload.len(), "device-bound message received");
            return;
        };

        let invocation = MethodInvocation::new(request.name.clone(), request.payload);
        let result = self.core.methods.dispatch(invocation);
        let response = MethodResponseEnvelope {
            request_id: request.request_id,
            status: result.status,
            payload: result.payload,
        };
        match serde_json::to_vec(&response) {
            Ok(encoded) => {
                if let Err(e) = binding.send(Bytes::from(encoded)).await {
                    warn!(method = %request.name, error = %e, "method response send failed");
                }
            }
            Err(e) => warn!(method = %request.name, error = %e, "method response encode failed"),
        }
    }

    /// Deliberate shutdown path: final ClientClose notification, then the
    /// notifier is muted so nothing can fire after close() returns.
    fn finish_closed(mut self) -> Core {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(DeviceError::ClientClosed));
        }
        if let Some(change) = self.machine.client_closed() {
            self.apply(&change);
        } else {
            self.core
                .status_tx
                .send_replace(ConnectionStatus::Disconnected);
        }
        self.core.notifier.mute();
        self.core
    }

    fn apply(&mut self, change: &StatusChange) {
        info!(status = ?change.status, reason = ?change.reason, "connection status changed");
        self.core.status_tx.send_replace(change.status);
        self.core.notifier.notify(change.status, change.reason);
    }
}

enum ConnectPhase {
    Connected(Box<dyn TransportBinding>),
    Closed,
    Settled,
}

enum SessionEnd {
    Closed,
    Dropped(TransportError),
}

enum FailureStep {
    Retry(Duration),
    Settled,
}

fn give_up_error(
    classification: FaultClassification,
    attempts: u32,
    error: TransportError,
) -> DeviceError {
    if attempts <= 1 {
        DeviceError::ConnectFailed {
            kind: classification.kind,
            source: error,
        }
    } else {
        DeviceError::RetriesExhausted {
            kind: classification.kind,
            attempts,
            source: error,
        }
    }
}
