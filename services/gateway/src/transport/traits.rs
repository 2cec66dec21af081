//! Controller transport traits
//!
//! Core traits and types for talking to the controller's shared memory,
//! independent of the wire protocol behind them.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

/// Transport layer error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No live session; nothing was sent
    #[error("Not connected")]
    NotConnected,

    /// A block read was attempted and failed
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// Connection setup failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Timeout occurred
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Malformed or rejected protocol frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransportStats {
    /// Connect attempts, successful or not
    pub connection_attempts: u64,
    /// Number of successful connections
    pub successful_connections: u64,
    /// Number of failed connections
    pub failed_connections: u64,
    /// Number of disconnections, requested or forced
    pub disconnections: u64,
    /// Completed block reads
    pub block_reads: u64,
    /// Failed block reads
    pub read_failures: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Last successful connection time
    pub last_connection: Option<SystemTime>,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
    }

    pub fn record_successful_connection(&mut self) {
        self.successful_connections += 1;
        self.last_connection = Some(SystemTime::now());
    }

    pub fn record_failed_connection(&mut self) {
        self.failed_connections += 1;
    }

    pub fn record_disconnection(&mut self) {
        self.disconnections += 1;
    }

    pub fn record_read(&mut self, bytes: usize) {
        self.block_reads += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn record_read_failure(&mut self) {
        self.read_failures += 1;
    }
}

/// Session with one controller
///
/// A transport is built unconnected, connected once, and thrown away after
/// any failure. Reconnection is the caller's job and always uses a fresh
/// instance.
#[async_trait]
pub trait ControllerTransport: Send + Sync + fmt::Debug {
    /// Get transport type identifier
    fn transport_type(&self) -> &str;

    /// Open the session and verify the peer answers
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the session; safe to call when already closed
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Whether the session is believed live
    fn is_connected(&self) -> bool;

    /// Read `len` bytes from data block `db` starting at byte `start`
    ///
    /// Returns [`TransportError::NotConnected`] without any I/O when the
    /// session is closed.
    async fn read_block(&mut self, db: u16, start: u32, len: usize)
        -> Result<Vec<u8>, TransportError>;
}

/// Factory for fresh, unconnected transports
pub trait TransportBuilder: Send + Sync {
    fn build(&self) -> Result<Box<dyn ControllerTransport>, TransportError>;
}

impl<F> TransportBuilder for F
where
    F: Fn() -> Result<Box<dyn ControllerTransport>, TransportError> + Send + Sync,
{
    fn build(&self) -> Result<Box<dyn ControllerTransport>, TransportError> {
        self()
    }
}
