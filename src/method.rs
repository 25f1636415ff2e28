//! Direct method invocation
//!
//! Device side: per-name handlers (plus an optional default) answer method
//! requests arriving over the active transport; a request nothing handles is
//! answered with status 501. Service side: [`MethodClient`] invokes a method on
//! a device through the hub's HTTP endpoint and enforces the response
//! timeout. A method timing out is an application-level outcome; it never
//! forces a connection status transition.

use crate::error::{DeviceError, DeviceResult};
use crate::transport::settings::API_VERSION;
use crate::transport::TransportError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Default response timeout when the caller does not specify one
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// One method call as seen by both sides
#[derive(Debug, Clone)]
pub struct MethodInvocation {
    pub name: String,
    pub payload: Value,
    pub response_timeout: Duration,
}

impl MethodInvocation {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

/// Outcome returned by a device-side handler or a service-side invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodResult {
    pub status: u16,
    pub payload: Value,
}

/// Device-side method handler. Runs on the connection supervisor task, so it
/// must not block.
pub type MethodHandler = Box<dyn FnMut(MethodInvocation) -> MethodResult + Send>;

/// Status reported when no handler is registered for a requested method
pub const METHOD_NOT_IMPLEMENTED: u16 = 501;

/// Routes inbound method requests to per-name handlers, falling back to the
/// default handler when no name matches. A request nothing handles is
/// answered with status 501.
#[derive(Default)]
pub struct MethodDispatcher {
    handlers: HashMap<String, MethodHandler>,
    default: Option<MethodHandler>,
}

impl MethodDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one method name. Replaces any previous
    /// registration for that name.
    pub fn set_handler(&mut self, name: impl Into<String>, handler: MethodHandler) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register the fallback handler for methods without a named handler
    pub fn set_default_handler(&mut self, handler: MethodHandler) {
        self.default = Some(handler);
    }

    pub fn dispatch(&mut self, invocation: MethodInvocation) -> MethodResult {
        if let Some(handler) = self.handlers.get_mut(&invocation.name) {
            handler(invocation)
        } else if let Some(handler) = self.default.as_mut() {
            handler(invocation)
        } else {
            debug!(method = %invocation.name, "no handler registered for method");
            MethodResult {
                status: METHOD_NOT_IMPLEMENTED,
                payload: Value::Null,
            }
        }
    }
}

/// Wire envelope for a hub-to-device method request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodRequestEnvelope {
    #[serde(rename = "methodName")]
    pub name: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// Wire envelope for the device-to-hub method response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodResponseEnvelope {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub status: u16,
    #[serde(default)]
    pub payload: Value,
}

/// Try to interpret an inbound transport payload as a method request.
/// Anything that does not parse is an ordinary device-bound message.
pub fn parse_request(payload: &Bytes) -> Option<MethodRequestEnvelope> {
    match serde_json::from_slice::<MethodRequestEnvelope>(payload) {
        Ok(envelope) if !envelope.name.is_empty() => Some(envelope),
        _ => None,
    }
}

/// Service-side method invocation over the hub HTTP endpoint
pub struct MethodClient {
    http: reqwest::Client,
    base_url: String,
    sas_token: Option<String>,
}

#[derive(Serialize)]
struct InvokeBody<'a> {
    #[serde(rename = "methodName")]
    name: &'a str,
    #[serde(rename = "responseTimeoutInSeconds")]
    response_timeout_secs: u64,
    payload: &'a Value,
}

impl MethodClient {
    pub fn new(base_url: impl Into<String>, sas_token: Option<String>) -> DeviceResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::protocol("http client construction failed", e))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            sas_token,
        })
    }

    fn invoke_url(&self, device_id: &str) -> String {
        format!(
            "{}/twins/{}/methods?api-version={}",
            self.base_url, device_id, API_VERSION
        )
    }

    /// Invoke a method on a device and wait for its response, up to the
    /// invocation's response timeout.
    pub async fn invoke(
        &self,
        device_id: &str,
        invocation: MethodInvocation,
    ) -> DeviceResult<MethodResult> {
        let body = InvokeBody {
            name: &invocation.name,
            response_timeout_secs: invocation.response_timeout.as_secs(),
            payload: &invocation.payload,
        };

        let mut request = self.http.post(self.invoke_url(device_id)).json(&body);
        if let Some(token) = &self.sas_token {
            request = request.header("Authorization", token.clone());
        }

        debug!(method = %invocation.name, device_id, "invoking direct method");
        let exchange = async {
            let response = request
                .send()
                .await
                .map_err(|e| TransportError::protocol("method invocation failed", e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(DeviceError::Transport(TransportError::Rejected {
                    status: status.as_u16(),
                    permanent: matches!(status.as_u16(), 401 | 403 | 404),
                    message: format!("method invocation returned {status}"),
                }));
            }
            let result: MethodResult = response
                .json()
                .await
                .map_err(|e| TransportError::protocol("method response decode failed", e))?;
            Ok(result)
        };

        match tokio::time::timeout(invocation.response_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::MethodTimeout {
                name: invocation.name,
                timeout: invocation.response_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_field_names() {
        let envelope = MethodRequestEnvelope {
            name: "reboot".to_string(),
            request_id: "42".to_string(),
            payload: json!({"delay": 5}),
        };
        let encoded = serde_json::to_string(&envelope).unwrap();
        assert!(encoded.contains("\"methodName\":\"reboot\""));
        assert!(encoded.contains("\"requestId\":\"42\""));
    }

    #[test]
    fn test_parse_request_accepts_method_envelope() {
        let payload = Bytes::from_static(
            br#"{"methodName":"setTelemetryInterval","requestId":"7","payload":{"interval":15}}"#,
        );
        let envelope = parse_request(&payload).unwrap();
        assert_eq!(envelope.name, "setTelemetryInterval");
        assert_eq!(envelope.request_id, "7");
        assert_eq!(envelope.payload["interval"], 15);
    }

    #[test]
    fn test_parse_request_rejects_plain_messages() {
        assert!(parse_request(&Bytes::from_static(b"hello device")).is_none());
        assert!(parse_request(&Bytes::from_static(br#"{"temp": 21}"#)).is_none());
        assert!(parse_request(&Bytes::from_static(br#"{"methodName":""}"#)).is_none());
    }

    #[test]
    fn test_parse_request_defaults_missing_payload() {
        let payload = Bytes::from_static(br#"{"methodName":"ping","requestId":"1"}"#);
        let envelope = parse_request(&payload).unwrap();
        assert_eq!(envelope.payload, Value::Null);
    }

    #[test]
    fn test_invocation_builder() {
        let invocation = MethodInvocation::new("reboot", json!({}))
            .with_response_timeout(Duration::from_secs(5));
        assert_eq!(invocation.response_timeout, Duration::from_secs(5));

        let defaulted = MethodInvocation::new("reboot", json!({}));
        assert_eq!(defaulted.response_timeout, DEFAULT_RESPONSE_TIMEOUT);
    }

    #[test]
    fn test_dispatcher_prefers_named_handler_over_default() {
        let mut dispatcher = MethodDispatcher::new();
        dispatcher.set_handler(
            "reboot",
            Box::new(|_| MethodResult {
                status: 200,
                payload: json!("named"),
            }),
        );
        dispatcher.set_default_handler(Box::new(|_| MethodResult {
            status: 200,
            payload: json!("default"),
        }));

        let named = dispatcher.dispatch(MethodInvocation::new("reboot", json!({})));
        assert_eq!(named.payload, json!("named"));

        let fallback = dispatcher.dispatch(MethodInvocation::new("anything", json!({})));
        assert_eq!(fallback.payload, json!("default"));
    }

    #[test]
    fn test_dispatcher_answers_unhandled_with_501() {
        let mut dispatcher = MethodDispatcher::new();
        let result = dispatcher.dispatch(MethodInvocation::new("reboot", json!({})));
        assert_eq!(result.status, METHOD_NOT_IMPLEMENTED);
        assert_eq!(result.payload, Value::Null);
    }

    #[test]
    fn test_invoke_url() {
        let client = MethodClient::new("https://hub.example.net:443", None).unwrap();
        assert_eq!(
            client.invoke_url("dev-01"),
            format!("https://hub.example.net:443/twins/dev-01/methods?api-version={API_VERSION}")
        );
    }
}
