//! Bridge configuration.

use crate::error::{MqttError, Result};
use crate::packet::Credentials;
use std::path::PathBuf;

/// Default MQTT port without TLS.
pub const DEFAULT_PORT: u16 = 1883;

/// Default MQTT port with TLS.
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Default delay in milliseconds between republish attempts of
/// unacknowledged server-originated messages.
pub const DEFAULT_REPEAT_RATE: u64 = 5000;

/// TLS listener settings. Certificate and key are both required; a CA
/// enables client-certificate verification.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: Option<PathBuf>,
}

/// Options for a [`crate::bridge::BridgeServer`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// MQTT port to listen on.
    pub port: u16,
    /// Comma-separated NATS server URLs.
    pub nats_urls: String,
    /// NATS subject on which NATS clients can query the retained store.
    /// Empty disables the handler.
    pub retained_request_topic: String,
    /// Path where bridge state is persisted. `None` disables persistence.
    pub storage_path: Option<PathBuf>,
    /// Delay in milliseconds between republish attempts of unacknowledged
    /// server-originated QoS-1 messages.
    pub repeat_rate: u64,
    /// Credentials for the bridge's own NATS connection.
    pub nats_credentials: Option<Credentials>,
    /// TLS listener settings; `None` listens in plain TCP.
    pub tls: Option<TlsConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            nats_urls: "nats://127.0.0.1:4222".to_string(),
            retained_request_topic: String::new(),
            storage_path: None,
            repeat_rate: DEFAULT_REPEAT_RATE,
            nats_credentials: None,
            tls: None,
        }
    }
}

impl BridgeConfig {
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_nats_urls(mut self, urls: impl Into<String>) -> Self {
        self.nats_urls = urls.into();
        self
    }

    #[must_use]
    pub fn with_retained_request_topic(mut self, topic: impl Into<String>) -> Self {
        self.retained_request_topic = topic.into();
        self
    }

    #[must_use]
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_repeat_rate(mut self, millis: u64) -> Self {
        self.repeat_rate = millis;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when TLS is configured without both a certificate
    /// and a key, or when the repeat rate is zero.
    pub fn validate(&self) -> Result<()> {
        if let Some(tls) = &self.tls {
            if tls.cert_file.as_os_str().is_empty() || tls.key_file.as_os_str().is_empty() {
                return Err(MqttError::Configuration(
                    "TLS requires both a certificate and a key file".to_string(),
                ));
            }
        }
        if self.repeat_rate == 0 {
            return Err(MqttError::Configuration(
                "repeat rate must be at least one millisecond".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(BridgeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        let config = BridgeConfig::default().with_tls(TlsConfig {
            cert_file: "server.pem".into(),
            key_file: PathBuf::new(),
            ca_file: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_repeat_rate_rejected() {
        assert!(BridgeConfig::default().with_repeat_rate(0).validate().is_err());
    }
}
