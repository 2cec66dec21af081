//! Message bus (MQTT)
//!
//! - [`client`]: long-lived gateway connection with reconnection and the
//!   control-topic subscription
//! - [`command`]: inbound START/STOP commands
//! - [`message`]: outbound reading payloads
//! - [`oneshot`]: connect, publish once, disconnect

pub mod client;
pub mod command;
pub mod message;
pub mod oneshot;

pub use client::{dispatch_commands, BusClient, BusConnection, BusConnectionState};
pub use command::ControlCommand;
pub use message::{ReadingMessage, ReadingPublisher};

use rumqttc::{ClientError, MqttOptions, QoS, TlsConfiguration, Transport};
use thiserror::Error;

use crate::config::BusConfig;

/// Bus error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    /// No broker session; nothing was queued
    #[error("Not connected to broker")]
    NotConnected,

    /// The client refused the request (queue full or closed)
    #[error("Client error: {0}")]
    Client(String),

    /// Network or protocol failure talking to the broker
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// TLS material could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<ClientError> for BusError {
    fn from(err: ClientError) -> Self {
        Self::Client(err.to_string())
    }
}

/// Map a configured QoS level
pub fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Connection options shared by the gateway and the control CLI
pub fn mqtt_options(config: &BusConfig, client_id: &str) -> Result<MqttOptions, BusError> {
    let mut options = MqttOptions::new(client_id, config.host.as_str(), config.port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);

    if let Some((username, password)) = config.credentials() {
        options.set_credentials(username, password);
    }

    if let Some(ca_path) = &config.ca_path {
        let ca = std::fs::read(ca_path)
            .map_err(|e| BusError::Tls(format!("cannot read {}: {e}", ca_path.display())))?;
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos(0), QoS::AtMostOnce);
        assert_eq!(qos(1), QoS::AtLeastOnce);
        assert_eq!(qos(2), QoS::ExactlyOnce);
        assert_eq!(qos(9), QoS::AtMostOnce);
    }

    #[test]
    fn test_options_carry_credentials_and_keep_alive() {
        let config = BusConfig {
            username: Some("gateway".to_string()),
            password: Some("secret".to_string()),
            keep_alive_secs: 30,
            ..Default::default()
        };
        let options = mqtt_options(&config, "telemetry-gateway").unwrap();
        assert_eq!(options.client_id(), "telemetry-gateway");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            options.credentials(),
            Some(("gateway".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_ca_path_enables_tls() {
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        writeln!(ca, "-----BEGIN CERTIFICATE-----").unwrap();

        let config = BusConfig {
            ca_path: Some(ca.path().to_path_buf()),
            ..Default::default()
        };
        let options = mqtt_options(&config, "gw").unwrap();
        assert!(matches!(options.transport(), Transport::Tls(_)));
    }

    #[test]
    fn test_missing_ca_is_tls_error() {
        let config = BusConfig {
            ca_path: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(matches!(mqtt_options(&config, "gw"), Err(BusError::Tls(_))));
    }
}
