//! Gateway configuration
//!
//! Layered with figment, lowest to highest:
//! built-in defaults, the YAML file, then `GATEWAY_` environment variables
//! (`__` separates nesting levels, e.g. `GATEWAY_BUS__PORT=8883`).

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::{default_channels, Channel, ChannelMap};
use crate::error::{GatewayError, Result};
use crate::scheduler::PublishPolicy;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";
/// Environment variable prefix
pub const ENV_PREFIX: &str = "GATEWAY_";
/// Placeholder substituted with the channel's topic segment
pub const CHANNEL_PLACEHOLDER: &str = "{channel}";

/// Controller backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerMode {
    #[default]
    S7,
    Simulated,
}

/// Controller connection and data block layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub mode: ControllerMode,
    pub address: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    pub db_number: u16,
    pub db_size: usize,
    pub timeout_ms: u64,
    pub simulated_min: f64,
    pub simulated_max: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: ControllerMode::S7,
            address: "192.168.0.1".to_string(),
            port: 102,
            rack: 0,
            slot: 1,
            db_number: 1,
            db_size: 54,
            timeout_ms: 3000,
            simulated_min: 700.0,
            simulated_max: 750.0,
        }
    }
}

/// MQTT broker connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// CA bundle; setting it switches the connection to TLS
    pub ca_path: Option<PathBuf>,
    pub keep_alive_secs: u64,
    /// Publish QoS (0, 1 or 2)
    pub qos: u8,
    /// Time allowed for one connect attempt to reach CONNACK
    pub connect_timeout_ms: u64,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Attempts allowed for the initial connect
    pub connection_retries: u32,
    pub initial_retry_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "telemetry-gateway".to_string(),
            username: None,
            password: None,
            ca_path: None,
            keep_alive_secs: 60,
            qos: 0,
            connect_timeout_ms: 10_000,
            reconnect_min_delay_ms: 1000,
            reconnect_max_delay_ms: 60_000,
            connection_retries: 5,
            initial_retry_delay_ms: 5000,
        }
    }
}

impl BusConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_min_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    /// Credentials when both halves are configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

/// Topic templates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub history: String,
    pub realtime: String,
    pub control: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            history: "plcTemperaturas/historial/{channel}".to_string(),
            realtime: "plcTemperaturas/tiemporeal/{channel}".to_string(),
            control: "gatewayTemperaturas/control/tiemporeal".to_string(),
        }
    }
}

/// Expand a topic template for one channel name
///
/// Spaces become underscores so the name is a single topic level.
pub fn channel_topic(template: &str, channel: &str) -> String {
    template.replace(CHANNEL_PLACEHOLDER, &channel.replace(' ', "_"))
}

/// Publish cadences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub history_interval_secs: u64,
    pub realtime_interval_secs: u64,
    pub history_policy: PublishPolicy,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            history_interval_secs: 1200,
            realtime_interval_secs: 2,
            history_policy: PublishPolicy::PresentOnly,
        }
    }
}

impl ScheduleConfig {
    pub fn history_interval(&self) -> Duration {
        Duration::from_secs(self.history_interval_secs)
    }

    pub fn realtime_interval(&self) -> Duration {
        Duration::from_secs(self.realtime_interval_secs)
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub controller: ControllerConfig,
    pub channels: Vec<Channel>,
    pub bus: BusConfig,
    pub topics: Topics,
    pub schedule: ScheduleConfig,
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            channels: default_channels(),
            bus: BusConfig::default(),
            topics: Topics::default(),
            schedule: ScheduleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Provider stack for `path`; a missing file contributes nothing
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate
    pub fn load(path: &Path) -> Result<Self> {
        let config: GatewayConfig = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject anything the gateway could not run with
    pub fn validate(&self) -> Result<()> {
        self.validate_controller()?;
        self.channel_map()?;
        self.validate_bus()?;
        self.validate_topics()?;

        if self.schedule.history_interval_secs == 0 {
            return Err(GatewayError::config("schedule.history_interval_secs must be > 0"));
        }
        if self.schedule.realtime_interval_secs == 0 {
            return Err(GatewayError::config("schedule.realtime_interval_secs must be > 0"));
        }

        Ok(())
    }

    /// Validated channel map for the configured block size
    pub fn channel_map(&self) -> Result<ChannelMap> {
        ChannelMap::new(self.channels.clone(), self.controller.db_size)
    }

    fn validate_controller(&self) -> Result<()> {
        let c = &self.controller;
        if c.mode == ControllerMode::S7 && c.address.trim().is_empty() {
            return Err(GatewayError::config("controller.address cannot be empty"));
        }
        if c.port == 0 {
            return Err(GatewayError::config("controller.port cannot be zero"));
        }
        if c.rack > 7 {
            return Err(GatewayError::config("controller.rack must be 0-7"));
        }
        if c.slot > 31 {
            return Err(GatewayError::config("controller.slot must be 0-31"));
        }
        if c.db_size == 0 || c.db_size > usize::from(u16::MAX) {
            return Err(GatewayError::config(format!(
                "controller.db_size {} out of range",
                c.db_size
            )));
        }
        if c.timeout_ms == 0 {
            return Err(GatewayError::config("controller.timeout_ms must be > 0"));
        }
        // The span itself must be finite
        if !(c.simulated_max - c.simulated_min).is_finite() {
            return Err(GatewayError::config(format!(
                "controller.simulated_min ({}) and simulated_max ({}) must be finite",
                c.simulated_min, c.simulated_max
            )));
        }
        if c.simulated_min >= c.simulated_max {
            return Err(GatewayError::config(format!(
                "controller.simulated_min ({}) must be below simulated_max ({})",
                c.simulated_min, c.simulated_max
            )));
        }
        Ok(())
    }

    fn validate_bus(&self) -> Result<()> {
        let b = &self.bus;
        if b.host.trim().is_empty() {
            return Err(GatewayError::config("bus.host cannot be empty"));
        }
        if b.port == 0 {
            return Err(GatewayError::config("bus.port cannot be zero"));
        }
        if b.client_id.trim().is_empty() {
            return Err(GatewayError::config("bus.client_id cannot be empty"));
        }
        match (&b.username, &b.password) {
            (Some(_), None) => {
                return Err(GatewayError::config("bus.username is set but bus.password is missing"))
            },
            (Some(_), Some(pass)) if pass.is_empty() => {
                return Err(GatewayError::config("bus.password cannot be empty"))
            },
            (None, Some(_)) => {
                return Err(GatewayError::config("bus.password is set without bus.username"))
            },
            _ => {},
        }
        if b.qos > 2 {
            return Err(GatewayError::config(format!("bus.qos {} must be 0, 1 or 2", b.qos)));
        }
        if b.keep_alive_secs == 0 {
            return Err(GatewayError::config("bus.keep_alive_secs must be > 0"));
        }
        if b.connect_timeout_ms == 0 {
            return Err(GatewayError::config("bus.connect_timeout_ms must be > 0"));
        }
        if b.reconnect_min_delay_ms > b.reconnect_max_delay_ms {
            return Err(GatewayError::config(format!(
                "bus.reconnect_min_delay_ms ({}) exceeds reconnect_max_delay_ms ({})",
                b.reconnect_min_delay_ms, b.reconnect_max_delay_ms
            )));
        }
        if b.connection_retries == 0 {
            return Err(GatewayError::config("bus.connection_retries must be >= 1"));
        }
        if let Some(ca) = &b.ca_path {
            if !ca.is_file() {
                return Err(GatewayError::config(format!(
                    "bus.ca_path {} is not a readable file",
                    ca.display()
                )));
            }
        }
        Ok(())
    }

    fn validate_topics(&self) -> Result<()> {
        let t = &self.topics;
        for (name, template) in [("history", &t.history), ("realtime", &t.realtime)] {
            if !template.contains(CHANNEL_PLACEHOLDER) {
                return Err(GatewayError::config(format!(
                    "topics.{name} must contain {CHANNEL_PLACEHOLDER}"
                )));
            }
            if template.contains(['#', '+']) {
                return Err(GatewayError::config(format!(
                    "topics.{name} cannot contain wildcards"
                )));
            }
        }
        if t.control.trim().is_empty() {
            return Err(GatewayError::config("topics.control cannot be empty"));
        }

        // Two channels must never share a topic
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.topic_segment()) {
                return Err(GatewayError::config(format!(
                    "channel '{}' collides with another channel once spaces become underscores",
                    channel.name
                )));
            }
        }
        Ok(())
    }
}
