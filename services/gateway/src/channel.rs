//! Channel map and block decoding
//!
//! A [`ChannelMap`] describes where each temperature channel lives inside the
//! controller data block. Decoding a block into [`Reading`]s is pure: the same
//! bytes and timestamp always give the same readings.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Size of an S7 REAL in bytes
pub const REAL_SIZE: usize = 4;

/// One named measurement channel inside the data block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Unique display name, e.g. "Torre Fusora"
    pub name: String,
    /// Byte offset of the big-endian REAL value
    pub value_offset: usize,
    /// Byte offset of the "sensor present" flag
    pub connected_offset: usize,
    /// Bit of the flag inside `connected_offset`
    #[serde(default)]
    pub connected_bit: u8,
}

impl Channel {
    pub fn new(name: impl Into<String>, value_offset: usize, connected_offset: usize) -> Self {
        Self {
            name: name.into(),
            value_offset,
            connected_offset,
            connected_bit: 0,
        }
    }

    /// Name usable as a topic segment
    pub fn topic_segment(&self) -> String {
        self.name.replace(' ', "_")
    }
}

/// One decoded channel sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub channel: String,
    pub connected: bool,
    /// Present only when `connected` and the decoded float is finite
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Whether this reading carries a publishable value
    pub fn is_present(&self) -> bool {
        self.connected && self.value.is_some()
    }
}

/// Ordered, validated set of channels
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMap {
    channels: Vec<Channel>,
}

impl ChannelMap {
    /// Build a map, checking names and offsets against the block size
    pub fn new(channels: Vec<Channel>, db_size: usize) -> Result<Self> {
        if channels.is_empty() {
            return Err(GatewayError::config("channel map is empty"));
        }

        let mut seen = HashSet::new();
        for channel in &channels {
            if channel.name.trim().is_empty() {
                return Err(GatewayError::config("channel name cannot be empty"));
            }
            if !seen.insert(channel.name.as_str()) {
                return Err(GatewayError::config(format!(
                    "duplicate channel name '{}'",
                    channel.name
                )));
            }
            if channel.value_offset + REAL_SIZE > db_size {
                return Err(GatewayError::config(format!(
                    "channel '{}': value offset {} does not fit a {}-byte block",
                    channel.name, channel.value_offset, db_size
                )));
            }
            if channel.connected_offset >= db_size {
                return Err(GatewayError::config(format!(
                    "channel '{}': flag offset {} outside a {}-byte block",
                    channel.name, channel.connected_offset, db_size
                )));
            }
            if channel.connected_bit > 7 {
                return Err(GatewayError::config(format!(
                    "channel '{}': flag bit {} must be 0-7",
                    channel.name, channel.connected_bit
                )));
            }
        }

        Ok(Self { channels })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Decode every channel from one block read
    pub fn decode(&self, block: &[u8], timestamp: DateTime<Utc>) -> Vec<Reading> {
        self.channels
            .iter()
            .map(|channel| decode_channel(channel, block, timestamp))
            .collect()
    }
}

/// The plant's eight-channel layout in DB1
pub fn default_channels() -> Vec<Channel> {
    vec![
        Channel::new("Torre Fusora", 0, 4),
        Channel::new("Linea 1", 6, 10),
        Channel::new("Linea 2", 12, 16),
        Channel::new("Linea 3", 18, 22),
        Channel::new("Linea 4", 24, 28),
        Channel::new("Estacion 1", 36, 40),
        Channel::new("Estacion 2", 42, 46),
        Channel::new("Linea 7", 48, 52),
    ]
}

fn decode_channel(channel: &Channel, block: &[u8], timestamp: DateTime<Utc>) -> Reading {
    let absent = |connected| Reading {
        channel: channel.name.clone(),
        connected,
        value: None,
        timestamp,
    };

    if !read_bit(block, channel.connected_offset, channel.connected_bit) {
        return absent(false);
    }

    match read_real(block, channel.value_offset) {
        Some(raw) if raw.is_finite() => Reading {
            channel: channel.name.clone(),
            connected: true,
            value: Some(round_one_decimal(raw)),
            timestamp,
        },
        // NaN marks a sensor the controller could not sample
        _ => absent(false),
    }
}

/// Read a single bit; out-of-range reads as unset
pub fn read_bit(block: &[u8], offset: usize, bit: u8) -> bool {
    block
        .get(offset)
        .map(|byte| (byte >> (bit & 0x07)) & 0x01 == 1)
        .unwrap_or(false)
}

/// Read a big-endian IEEE-754 single
pub fn read_real(block: &[u8], offset: usize) -> Option<f32> {
    let bytes = block.get(offset..offset + REAL_SIZE)?;
    Some(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Round the widened controller float to one decimal place, ties to even
///
/// An `f32` times ten is exact in `f64`, so a tie here is a true decimal tie.
pub fn round_one_decimal(raw: f32) -> f64 {
    (f64::from(raw) * 10.0).round_ties_even() / 10.0
}
