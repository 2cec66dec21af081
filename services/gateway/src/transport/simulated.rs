//! Simulated controller
//!
//! Stands in for a CPU when no hardware is reachable. Every channel in the
//! map reports "sensor present" and a random temperature in `[min, max)`.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

use super::traits::{ControllerTransport, TransportError};
use crate::channel::ChannelMap;

/// Simulated controller configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedConfig {
    pub db_size: usize,
    pub min: f64,
    pub max: f64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            db_size: 54,
            min: 700.0,
            max: 750.0,
        }
    }
}

/// Simulated transport implementation
#[derive(Debug)]
pub struct SimulatedTransport {
    config: SimulatedConfig,
    channels: Arc<ChannelMap>,
    connected: bool,
}

impl SimulatedTransport {
    pub fn new(config: SimulatedConfig, channels: Arc<ChannelMap>) -> Self {
        Self {
            config,
            channels,
            connected: false,
        }
    }

    /// Fresh block image with every channel present
    fn synthesize(&self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let mut block = vec![0u8; self.config.db_size];

        for channel in self.channels.channels() {
            let value = rng.gen_range(self.config.min..self.config.max) as f32;
            if let Some(slot) = block.get_mut(channel.value_offset..channel.value_offset + 4) {
                slot.copy_from_slice(&value.to_be_bytes());
            }
            if let Some(flag) = block.get_mut(channel.connected_offset) {
                *flag |= 1 << channel.connected_bit;
            }
        }

        block
    }
}

#[async_trait]
impl ControllerTransport for SimulatedTransport {
    fn transport_type(&self) -> &str {
        "simulated"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        info!(
            "Simulated controller online ({} channels, {:.1}-{:.1})",
            self.channels.len(),
            self.config.min,
            self.config.max
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_block(
        &mut self,
        _db: u16,
        start: u32,
        len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let block = self.synthesize();
        let start = start as usize;
        let data = block.get(start..start + len).ok_or_else(|| {
            TransportError::ReadFailed(format!(
                "range {}..{} outside the {}-byte block",
                start,
                start + len,
                block.len()
            ))
        })?;
        debug!(len, "Simulated block read");
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::default_channels;
    use chrono::Utc;

    fn transport() -> SimulatedTransport {
        let map = ChannelMap::new(default_channels(), 54).unwrap();
        SimulatedTransport::new(SimulatedConfig::default(), Arc::new(map))
    }

    #[tokio::test]
    async fn test_every_channel_in_range() {
        let mut sim = transport();
        sim.connect().await.unwrap();

        let block = sim.read_block(1, 0, 54).await.unwrap();
        let readings = sim.channels.decode(&block, Utc::now());
        assert_eq!(readings.len(), 8);
        for reading in readings {
            assert!(reading.connected, "{} should be present", reading.channel);
            let value = reading.value.unwrap();
            assert!((700.0..=750.0).contains(&value), "{value} out of range");
        }
    }

    #[tokio::test]
    async fn test_requires_connect() {
        let mut sim = transport();
        assert!(matches!(
            sim.read_block(1, 0, 54).await,
            Err(TransportError::NotConnected)
        ));

        sim.connect().await.unwrap();
        sim.disconnect().await.unwrap();
        assert!(!sim.is_connected());
    }

    #[tokio::test]
    async fn test_out_of_range_read() {
        let mut sim = transport();
        sim.connect().await.unwrap();
        assert!(matches!(
            sim.read_block(1, 50, 10).await,
            Err(TransportError::ReadFailed(_))
        ));
    }
}
