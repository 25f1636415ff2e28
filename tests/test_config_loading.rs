//! Configuration loading from files and environment

use hublink::config::{ConfigError, DeviceConfig};
use hublink::retry::RetryPolicy;
use hublink::transport::TransportKind;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write config");
    file
}

#[test]
fn test_load_from_file() {
    let file = write_config(
        r#"
[device]
id = "dev-01"

[hub]
hostname = "hub.example.net"

[transport]
kind = "mqtt-websocket"

[retry]
policy = "exponential-backoff"
min_backoff_ms = 50
max_backoff_ms = 2000
max_elapsed_secs = 120
"#,
    );

    let config = DeviceConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.device.id, "dev-01");
    assert_eq!(config.transport.kind, TransportKind::MqttWebSocket);
    assert_eq!(
        config.retry_policy(),
        RetryPolicy::ExponentialBackoffWithJitter {
            min_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(2000),
            max_elapsed: Duration::from_secs(120),
        }
    );
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = DeviceConfig::load_from_file(std::path::Path::new("/nonexistent/device.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let file = write_config("[device\nid = broken");
    let result = DeviceConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_sas_token_resolved_from_environment() {
    let file = write_config(
        r#"
[device]
id = "dev-01"

[hub]
hostname = "hub.example.net"
sas_token_env = "HUBLINK_TEST_SAS_TOKEN"
"#,
    );

    std::env::set_var(
        "HUBLINK_TEST_SAS_TOKEN",
        "SharedAccessSignature sr=hub&sig=abc&se=1700000000",
    );
    let config = DeviceConfig::load_from_file(file.path()).unwrap();
    let token = config.sas_token().unwrap().unwrap();
    assert!(token.starts_with("SharedAccessSignature"));
    std::env::remove_var("HUBLINK_TEST_SAS_TOKEN");
}

#[test]
fn test_unknown_transport_kind_rejected() {
    let file = write_config(
        r#"
[device]
id = "dev-01"

[hub]
hostname = "hub.example.net"

[transport]
kind = "carrier-pigeon"
"#,
    );
    let result = DeviceConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}
