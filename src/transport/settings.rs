//! Endpoint and option construction for transport bindings
//!
//! Pure functions building the per-protocol connection parameters from the
//! device configuration. Keeping this separate from the bindings avoids
//! duplicating it between initial connects and reconnect attempts.

use super::{TransportError, TransportKind};
use crate::config::{ConfigError, DeviceConfig};
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;

/// API version attached to every data-plane call
pub const API_VERSION: &str = "2020-03-13";

/// Resolved connection parameters for one transport binding
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub kind: TransportKind,
    pub hostname: String,
    pub port: u16,
    pub device_id: String,
    pub module_id: Option<String>,
    pub sas_token: Option<String>,
    pub keep_alive: Duration,
    pub operation_timeout: Duration,
}

impl TransportSettings {
    /// Build settings from configuration, resolving the SAS token from its
    /// environment variable.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        let kind = config.transport.kind;
        Ok(Self {
            kind,
            hostname: config.hub.hostname.clone(),
            port: config.hub.port.unwrap_or_else(|| kind.default_port()),
            device_id: config.device.id.clone(),
            module_id: config.device.module_id.clone(),
            sas_token: config.sas_token()?,
            keep_alive: config.keep_alive(),
            operation_timeout: config.operation_timeout(),
        })
    }

    /// MQTT/AMQP username: `{hostname}/{device_id}/?api-version=...`
    pub fn username(&self) -> String {
        format!(
            "{}/{}/?api-version={}",
            self.hostname, self.device_id, API_VERSION
        )
    }

    /// Base URL for HTTP data-plane calls
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.hostname, self.port)
    }

    /// Device-to-cloud event path
    pub fn events_path(&self) -> String {
        format!(
            "/devices/{}/messages/events?api-version={}",
            self.device_id, API_VERSION
        )
    }

    /// Cloud-to-device message path (long poll)
    pub fn device_bound_path(&self) -> String {
        format!(
            "/devices/{}/messages/deviceBound?api-version={}",
            self.device_id, API_VERSION
        )
    }

    /// WebSocket endpoint for tunneled AMQP/MQTT
    pub fn websocket_url(&self) -> String {
        format!("wss://{}:{}/$iothub/websocket", self.hostname, self.port)
    }
}

/// Configure MQTT options for the device connection.
///
/// The hub requires the MQTT client id to equal the device id, so a second
/// connection for the same identity collides server-side by design.
pub fn configure_mqtt_options(settings: &TransportSettings) -> Result<MqttOptions, TransportError> {
    if settings.hostname.is_empty() {
        return Err(TransportError::InvalidEndpoint(
            "empty hub hostname".to_string(),
        ));
    }

    let mut mqtt_options = match settings.kind {
        TransportKind::MqttTcp => {
            let mut options = MqttOptions::new(
                settings.device_id.clone(),
                settings.hostname.clone(),
                settings.port,
            );
            options.set_transport(RumqttcTransport::tls_with_default_config());
            options
        }
        TransportKind::MqttWebSocket => {
            // For websockets rumqttc takes the full URL in place of the host
            let mut options = MqttOptions::new(
                settings.device_id.clone(),
                settings.websocket_url(),
                settings.port,
            );
            options.set_transport(RumqttcTransport::wss_with_default_config());
            options
        }
        other => {
            return Err(TransportError::InvalidEndpoint(format!(
                "{other} is not an MQTT variant"
            )));
        }
    };

    if let Some(token) = &settings.sas_token {
        mqtt_options.set_credentials(settings.username(), token.clone());
    }

    mqtt_options.set_keep_alive(settings.keep_alive);
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    fn test_settings(kind: TransportKind) -> TransportSettings {
        TransportSettings {
            kind,
            hostname: "hub.example.net".to_string(),
            port: kind.default_port(),
            device_id: "dev-01".to_string(),
            module_id: None,
            sas_token: Some("SharedAccessSignature sr=...".to_string()),
            keep_alive: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_from_config_uses_protocol_default_port() {
        let config = DeviceConfig::load_from_str(
            r#"
[device]
id = "dev-01"

[hub]
hostname = "hub.example.net"

[transport]
kind = "amqp-tcp"
"#,
        )
        .unwrap();
        let settings = TransportSettings::from_config(&config).unwrap();
        assert_eq!(settings.port, 5671);
        assert_eq!(settings.kind, TransportKind::AmqpTcp);
        assert!(settings.sas_token.is_none());
    }

    #[test]
    fn test_username_format() {
        let settings = test_settings(TransportKind::MqttTcp);
        assert_eq!(
            settings.username(),
            format!("hub.example.net/dev-01/?api-version={API_VERSION}")
        );
    }

    #[test]
    fn test_data_plane_paths() {
        let settings = test_settings(TransportKind::Http);
        assert_eq!(
            settings.events_path(),
            format!("/devices/dev-01/messages/events?api-version={API_VERSION}")
        );
        assert!(settings.device_bound_path().contains("/messages/deviceBound"));
        assert_eq!(settings.base_url(), "https://hub.example.net:443");
    }

    #[test]
    fn test_configure_mqtt_options_tcp() {
        let settings = test_settings(TransportKind::MqttTcp);
        let options = configure_mqtt_options(&settings);
        assert!(options.is_ok());
    }

    #[test]
    fn test_configure_mqtt_options_websocket() {
        let settings = test_settings(TransportKind::MqttWebSocket);
        assert!(settings.websocket_url().starts_with("wss://"));
        let options = configure_mqtt_options(&settings);
        assert!(options.is_ok());
    }

    #[test]
    fn test_configure_mqtt_options_rejects_non_mqtt_kind() {
        let settings = test_settings(TransportKind::AmqpTcp);
        let result = configure_mqtt_options(&settings);
        assert!(matches!(result, Err(TransportError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_configure_mqtt_options_rejects_empty_hostname() {
        let mut settings = test_settings(TransportKind::MqttTcp);
        settings.hostname = String::new();
        let result = configure_mqtt_options(&settings);
        assert!(matches!(result, Err(TransportError::InvalidEndpoint(_))));
    }
}
