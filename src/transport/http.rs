//! HTTP transport binding (short-poll send, long-poll receive)
//!
//! HTTP carries no session, so `connect()` is a credential/reachability
//! probe and "disconnects" only ever surface as failed requests.

use super::{TransportBinding, TransportError, TransportEvent, TransportKind, TransportSettings};
use crate::error::redact_credentials;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info};

/// Pause between empty long-poll rounds so a quiet hub is not hammered
const POLL_BACKOFF: Duration = Duration::from_millis(500);

pub struct HttpBinding {
    settings: TransportSettings,
    client: Option<reqwest::Client>,
}

impl HttpBinding {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            client: None,
        }
    }

    fn authorization(&self) -> Option<String> {
        self.settings.sas_token.clone()
    }

    fn events_url(&self) -> String {
        format!("{}{}", self.settings.base_url(), self.settings.events_path())
    }

    fn device_bound_url(&self) -> String {
        format!(
            "{}{}",
            self.settings.base_url(),
            self.settings.device_bound_path()
        )
    }

    fn map_error(&self, error: reqwest::Error, operation: &str) -> TransportError {
        if error.is_timeout() {
            return TransportError::Timeout {
                operation: operation.to_string(),
            };
        }

        // Render the full cause chain; reqwest buries TLS causes several
        // levels down depending on the connector.
        let mut rendered = error.to_string();
        let mut cause: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(&error);
        while let Some(err) = cause {
            rendered.push_str(": ");
            rendered.push_str(&err.to_string());
            cause = err.source();
        }
        let text = redact_credentials(&rendered);
        let lower = text.to_lowercase();
        if lower.contains("certificate")
            || lower.contains("tls")
            || lower.contains("handshake")
            || lower.contains("ssl")
        {
            TransportError::Tls {
                message: text,
                source: Some(Box::new(error)),
            }
        } else if error.is_connect() {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                text,
            ))
        } else {
            TransportError::protocol(format!("{operation} failed: {text}"), error)
        }
    }
}

/// Map an HTTP status onto the transport error taxonomy. Throttling and
/// server-side overload are transient; auth and missing-device are not.
fn check_status(status: StatusCode, operation: &str) -> Result<(), TransportError> {
    if status.is_success() {
        return Ok(());
    }
    let permanent = matches!(
        status.as_u16(),
        401 | 403 | 404 | 405 | 409 | 412 | 413
    );
    Err(TransportError::Rejected {
        status: status.as_u16(),
        permanent,
        message: format!("{operation} returned {status}"),
    })
}

#[async_trait]
impl TransportBinding for HttpBinding {
    fn kind(&self) -> TransportKind {
        self.settings.kind
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let client = reqwest::Client::builder()
            .timeout(self.settings.operation_timeout)
            .build()
            .map_err(|e| TransportError::protocol("http client construction failed", e))?;

        // Probe the device-bound endpoint so bad credentials and TLS
        // failures surface at open time rather than on the first send.
        let mut request = client.get(self.device_bound_url());
        if let Some(token) = self.authorization() {
            request = request.header("Authorization", token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.map_error(e, "http connect probe"))?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            check_status(status, "http connect probe")?;
        }

        info!(
            device_id = %self.settings.device_id,
            "HTTP binding ready"
        );
        self.client = Some(client);
        Ok(())
    }

    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;
        let mut request = client
            .post(self.events_url())
            .header("Content-Type", "application/json")
            .body(payload.to_vec());
        if let Some(token) = self.authorization() {
            request = request.header("Authorization", token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_error(e, "event post"))?;
        check_status(response.status(), "event post")
    }

    async fn recv(&mut self) -> Result<TransportEvent, TransportError> {
        let client = self.client.clone().ok_or(TransportError::NotConnected)?;
        loop {
            let mut request = client.get(self.device_bound_url());
            if let Some(token) = self.authorization() {
                request = request.header("Authorization", token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| self.map_error(e, "device-bound poll"))?;

            match response.status() {
                StatusCode::NO_CONTENT => {
                    debug!("no device-bound message pending");
                    tokio::time::sleep(POLL_BACKOFF).await;
                }
                status => {
                    check_status(status, "device-bound poll")?;
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| self.map_error(e, "device-bound body"))?;
                    return Ok(TransportEvent::Message(body));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.client = None;
        Ok(())
    }
}
