//! Outbound reading payloads

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::BusError;
use crate::channel::Reading;

/// JSON body published for one reading
///
/// `{"timestamp": 1718000000.5, "equipo": "Torre Fusora", "temperatura": 725.3}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingMessage {
    /// Unix seconds with sub-second precision
    pub timestamp: f64,
    #[serde(rename = "equipo")]
    pub channel: String,
    /// `null` only when absent readings are published on purpose
    #[serde(rename = "temperatura")]
    pub temperature: Option<f64>,
}

impl ReadingMessage {
    pub fn from_reading(reading: &Reading) -> Self {
        Self {
            timestamp: reading.timestamp.timestamp_micros() as f64 / 1_000_000.0,
            channel: reading.channel.clone(),
            temperature: reading.value,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Sink for outbound publishes
///
/// Implementations must fail fast instead of queueing while offline.
#[async_trait]
pub trait ReadingPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retained: bool)
        -> Result<(), BusError>;
}
