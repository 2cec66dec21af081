//! Error handling for the telemetry gateway
//!
//! Controller and bus failures carry their own error types so callers can tell
//! "not connected" apart from "the operation failed". Everything that can end
//! the process funnels into [`GatewayError`].

use thiserror::Error;

use crate::bus::BusError;
use crate::transport::TransportError;

/// Gateway error type
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Controller transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Message bus errors
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Payload encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded retry budget ran out
    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl GatewayError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error must stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::RetriesExhausted { .. })
    }
}

impl From<figment::Error> for GatewayError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Failure of a controller connect attempt
///
/// The reader is already `Disconnected` when this is returned.
#[derive(Error, Debug)]
#[error("Controller connect failed: {0}")]
pub struct ConnectError(#[from] pub TransportError);

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;
