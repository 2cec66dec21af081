//! Shared test doubles: a scriptable controller and a recording publisher

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gateway::bus::{BusError, ReadingMessage, ReadingPublisher};
use gateway::channel::{default_channels, ChannelMap};
use gateway::reader::ControllerReader;
use gateway::transport::{ControllerTransport, TransportBuilder, TransportError};

pub const DB_SIZE: usize = 54;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Block with the given channels present: `(value_offset, flag_offset, value)`
pub fn block_with(present: &[(usize, usize, f32)]) -> Vec<u8> {
    let mut block = vec![0u8; DB_SIZE];
    for &(value_offset, flag_offset, value) in present {
        block[value_offset..value_offset + 4].copy_from_slice(&value.to_be_bytes());
        block[flag_offset] |= 0x01;
    }
    block
}

/// Only "Torre Fusora" present
pub fn torre_fusora_block(value: f32) -> Vec<u8> {
    block_with(&[(0, 4, value)])
}

pub fn channel_map() -> Arc<ChannelMap> {
    Arc::new(ChannelMap::new(default_channels(), DB_SIZE).unwrap())
}

#[derive(Debug, Default)]
struct ControllerState {
    block: Vec<u8>,
    connect_failures: VecDeque<()>,
    read_failures: VecDeque<()>,
    builds: usize,
    connects: usize,
    reads: usize,
}

/// In-memory controller shared by every transport built from it
#[derive(Debug, Clone, Default)]
pub struct FakeController {
    state: Arc<Mutex<ControllerState>>,
}

impl FakeController {
    pub fn new(block: Vec<u8>) -> Self {
        let controller = Self::default();
        controller.state.lock().block = block;
        controller
    }

    pub fn set_block(&self, block: Vec<u8>) {
        self.state.lock().block = block;
    }

    /// The next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().connect_failures.extend(std::iter::repeat(()).take(n));
    }

    /// The next `n` block reads fail
    pub fn fail_next_reads(&self, n: usize) {
        self.state.lock().read_failures.extend(std::iter::repeat(()).take(n));
    }

    pub fn builds(&self) -> usize {
        self.state.lock().builds
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }

    pub fn builder(&self) -> Arc<dyn TransportBuilder> {
        let controller = self.clone();
        Arc::new(move || -> Result<Box<dyn ControllerTransport>, TransportError> {
            controller.state.lock().builds += 1;
            Ok(Box::new(FakeTransport {
                controller: controller.clone(),
                connected: false,
            }))
        })
    }

    pub fn reader(&self, label: &str) -> ControllerReader {
        ControllerReader::new(label, self.builder(), channel_map(), 1, DB_SIZE)
    }
}

#[derive(Debug)]
struct FakeTransport {
    controller: FakeController,
    connected: bool,
}

#[async_trait]
impl ControllerTransport for FakeTransport {
    fn transport_type(&self) -> &str {
        "fake"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.controller.state.lock();
        state.connects += 1;
        if state.connect_failures.pop_front().is_some() {
            return Err(TransportError::ConnectionFailed("CPU unreachable".to_string()));
        }
        self.connected = true;
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
        let mut state = self.controller.state.lock();
        state.reads += 1;
        if state.read_failures.pop_front().is_some() {
            self.connected = false;
            return Err(TransportError::ReadFailed("connection reset".to_string()));
        }
        let start = start as usize;
        Ok(state.block[start..start + len].to_vec())
    }
}

/// One captured publish
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub message: ReadingMessage,
    pub retained: bool,
}

/// Publisher that records instead of sending
#[derive(Debug)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Published>>,
    online: AtomicBool,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
        }
    }
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.published.lock().len()
    }
}

#[async_trait]
impl ReadingPublisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retained: bool,
    ) -> Result<(), BusError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        let message: ReadingMessage = serde_json::from_slice(&payload)
            .map_err(|e| BusError::Client(format!("bad payload: {e}")))?;
        self.published.lock().push(Published {
            topic: topic.to_string(),
            message,
            retained,
        });
        Ok(())
    }
}
