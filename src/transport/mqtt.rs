//! MQTT transport binding (direct TLS and WebSocket-tunneled)
//!
//! Built on the rumqttc v5 client. `connect()` completes only on ConnAck,
//! never on the first arbitrary event, and the binding keeps at most one
//! outstanding connect attempt.

use super::settings::configure_mqtt_options;
use super::{TransportBinding, TransportError, TransportEvent, TransportKind, TransportSettings};
use crate::error::redact_credentials;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop};
use tracing::{debug, info, warn};

pub struct MqttBinding {
    settings: TransportSettings,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
}

impl MqttBinding {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            client: None,
            event_loop: None,
        }
    }

    fn events_topic(&self) -> String {
        format!("devices/{}/messages/events/", self.settings.device_id)
    }

    fn device_bound_filter(&self) -> String {
        format!("devices/{}/messages/devicebound/#", self.settings.device_id)
    }
}

#[async_trait]
impl TransportBinding for MqttBinding {
    fn kind(&self) -> TransportKind {
        self.settings.kind
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.client.is_some() {
            return Err(TransportError::protocol_msg(
                "connect attempt already outstanding",
            ));
        }

        let mqtt_options = configure_mqtt_options(&self.settings)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 10);

        // Drive the event loop until the broker acknowledges the session
        let connack = tokio::time::timeout(self.settings.operation_timeout, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(other) => {
                        debug!("event before ConnAck ignored: {:?}", other);
                    }
                    Err(e) => return Err(map_connection_error(e)),
                }
            }
        })
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "mqtt connect (no ConnAck)".to_string(),
        })??;

        if connack.code != ConnectReturnCode::Success {
            return Err(TransportError::Rejected {
                status: connack.code as u16,
                permanent: matches!(
                    connack.code,
                    ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
                ),
                message: format!("broker refused connection: {:?}", connack.code),
            });
        }

        client
            .subscribe(self.device_bound_filter(), QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::protocol("devicebound subscribe failed", e))?;

        info!(
            device_id = %self.settings.device_id,
            kind = %self.settings.kind,
            "MQTT connection established"
        );
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        Ok(())
    }

    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;
        client
            .publish(self.events_topic(), QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|e| TransportError::protocol("event publish failed", e))
    }

    async fn recv(&mut self) -> Result<TransportEvent, TransportError> {
        let event_loop = self.event_loop.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(TransportEvent::Message(publish.payload));
                }
                Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                    return Err(TransportError::ServerClosed {
                        reason: format!("{:?}", disconnect.reason_code),
                    });
                }
                Ok(other) => {
                    debug!("infrastructure event: {:?}", other);
                }
                Err(e) => return Err(map_connection_error(e)),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                warn!("mqtt disconnect failed: {}", e);
            }
        }
        self.event_loop = None;
        Ok(())
    }
}

/// Map a rumqttc event loop error onto the transport error taxonomy.
///
/// rumqttc wraps TLS and socket failures differently per transport mode, so
/// this inspects the rendered cause text instead of matching variants and
/// keeps the original error as the source for the classifier to walk.
fn map_connection_error(error: ConnectionError) -> TransportError {
    let text = redact_credentials(&error.to_string());
    let lower = text.to_lowercase();

    if lower.contains("tls")
        || lower.contains("certificate")
        || lower.contains("handshake")
        || lower.contains("invalid peer")
    {
        TransportError::Tls {
            message: text,
            source: Some(Box::new(error)),
        }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        TransportError::Timeout {
            operation: format!("mqtt: {text}"),
        }
    } else {
        TransportError::protocol(format!("mqtt event loop error: {text}"), error)
    }
}
