//! Error types for hublink device and service operations
//!
//! Every layer keeps its own `thiserror` enum and preserves `#[source]`
//! chains; the fault classifier depends on being able to walk causes all
//! the way down. Anything that might carry credentials goes through
//! [`redact_credentials`] before it is logged or surfaced.

use crate::connection::ConnectionStatus;
use crate::fault::ErrorKind;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Main error type surfaced by the device client
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("connection attempt failed ({kind:?})")]
    ConnectFailed {
        kind: ErrorKind,
        #[source]
        source: TransportError,
    },

    #[error("retries exhausted after {attempts} attempts ({kind:?})")]
    RetriesExhausted {
        kind: ErrorKind,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("client is not open - current status: {status:?}")]
    NotOpen { status: ConnectionStatus },

    #[error("client was closed")]
    ClientClosed,

    #[error("transport error")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("method '{name}' did not respond within {timeout:?}")]
    MethodTimeout { name: String, timeout: Duration },

    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for device client operations
pub type DeviceResult<T> = Result<T, DeviceError>;

static SHARED_ACCESS_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(SharedAccessKey|SharedAccessSignature|sig|skn)=[^;&\s]+")
        .expect("static redaction pattern")
});

static GENERIC_SECRET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("static redaction pattern")
});

/// Strip shared access keys, signatures and generic secrets from error text.
///
/// Connection strings and SAS tokens routinely end up embedded in transport
/// error messages; they must never reach logs or callers intact.
pub fn redact_credentials(message: &str) -> String {
    let redacted = SHARED_ACCESS_KEY.replace_all(message, "${1}=***");
    let redacted = GENERIC_SECRET.replace_all(&redacted, "${1}=***");

    // Cap very long transport dumps
    const MAX_LEN: usize = 500;
    if redacted.len() > MAX_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_LEN - suffix.len();
        while !redacted.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}{}", &redacted[..cut], suffix)
    } else {
        redacted.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_shared_access_key() {
        let message =
            "connect failed: HostName=hub.example.net;DeviceId=d1;SharedAccessKey=c2VjcmV0cw==";
        let redacted = redact_credentials(message);

        assert!(!redacted.contains("c2VjcmV0cw=="));
        assert!(redacted.contains("SharedAccessKey=***"));
        assert!(redacted.contains("DeviceId=d1"));
    }

    #[test]
    fn test_redacts_sas_signature() {
        let message = "401 body: sr=hub%2Fdevices%2Fd1&sig=abc123&se=1700000000";
        let redacted = redact_credentials(message);

        assert!(!redacted.contains("abc123"));
        assert!(redacted.contains("sig=***"));
    }

    #[test]
    fn test_redacts_generic_secrets_case_insensitive() {
        let redacted = redact_credentials("auth failed: PASSWORD=hunter2 Token: tok456");
        assert!(!redacted.contains("hunter2"));
        assert!(!redacted.contains("tok456"));
    }

    #[test]
    fn test_truncates_long_messages() {
        let long = "x".repeat(600);
        let redacted = redact_credentials(&long);
        assert!(redacted.len() <= 500);
        assert!(redacted.ends_with("...[truncated]"));
    }

    #[test]
    fn test_plain_message_unchanged() {
        assert_eq!(redact_credentials("connection reset"), "connection reset");
    }

    #[test]
    fn test_error_display_not_empty() {
        let errors: Vec<DeviceError> = vec![
            DeviceError::NotOpen {
                status: ConnectionStatus::Disconnected,
            },
            DeviceError::ClientClosed,
            DeviceError::MethodTimeout {
                name: "reboot".to_string(),
                timeout: Duration::from_secs(30),
            },
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
