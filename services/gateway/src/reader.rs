//! Controller reader
//!
//! Owns one controller session and turns block reads into [`Reading`]s.
//! The reader fails closed: any failure leaves it `Disconnected`, and a
//! disconnected reader never touches the network until `connect()` is called
//! again with a freshly built transport.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::{ChannelMap, Reading};
use crate::error::ConnectError;
use crate::transport::{ControllerTransport, TransportBuilder, TransportError, TransportStats};

/// Reader connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// The transport answered at the most recent transition
    Connected,
}

/// One controller session plus the layout used to decode it
pub struct ControllerReader {
    label: String,
    builder: Arc<dyn TransportBuilder>,
    channels: Arc<ChannelMap>,
    db_number: u16,
    db_size: usize,
    transport: Option<Box<dyn ControllerTransport>>,
    state: ConnectionState,
    stats: TransportStats,
}

impl std::fmt::Debug for ControllerReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerReader")
            .field("label", &self.label)
            .field("db_number", &self.db_number)
            .field("db_size", &self.db_size)
            .field("state", &self.state)
            .finish()
    }
}

impl ControllerReader {
    pub fn new(
        label: impl Into<String>,
        builder: Arc<dyn TransportBuilder>,
        channels: Arc<ChannelMap>,
        db_number: u16,
        db_size: usize,
    ) -> Self {
        Self {
            label: label.into(),
            builder,
            channels,
            db_number,
            db_size,
            transport: None,
            state: ConnectionState::Disconnected,
            stats: TransportStats::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// Open a new session, discarding any previous one
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        self.release().await;
        self.stats.record_connection_attempt();

        let result = self.open().await;
        match &result {
            Ok(transport_type) => {
                self.state = ConnectionState::Connected;
                self.stats.record_successful_connection();
                info!(reader = %self.label, transport = %transport_type, "Controller connected");
            },
            Err(e) => {
                self.stats.record_failed_connection();
                warn!(reader = %self.label, error = %e, "Controller connect failed");
            },
        }
        result.map(|_| ())
    }

    async fn open(&mut self) -> Result<String, ConnectError> {
        let mut transport = self.builder.build()?;
        transport.connect().await?;

        if !transport.is_connected() {
            // Never keep a handle that did not come up
            let _ = transport.disconnect().await;
            return Err(ConnectError(TransportError::ConnectionFailed(
                "transport not live after connect".to_string(),
            )));
        }

        let transport_type = transport.transport_type().to_string();
        self.transport = Some(transport);
        Ok(transport_type)
    }

    /// Close the session; no-op when already closed
    pub async fn disconnect(&mut self) {
        let was_connected = self.is_connected();
        self.release().await;
        if was_connected {
            info!(reader = %self.label, "Controller disconnected");
        }
    }

    /// Connect only when not already connected
    pub async fn ensure_connection(&mut self) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        debug!(reader = %self.label, "Controller not connected, connecting");
        self.connect().await
    }

    /// Read the data block and decode every channel
    ///
    /// Returns `None` without I/O when disconnected. A failed read drops the
    /// session before returning `None`.
    pub async fn read_all(&mut self) -> Option<Vec<Reading>> {
        if !self.is_connected() {
            return None;
        }

        let live = self
            .transport
            .as_ref()
            .map(|transport| transport.is_connected())
            .unwrap_or(false);
        if !live {
            warn!(reader = %self.label, "Controller session lost");
            self.release().await;
            return None;
        }
        let transport = self.transport.as_mut()?;

        match transport.read_block(self.db_number, 0, self.db_size).await {
            Ok(block) if block.len() != self.db_size => {
                self.stats.record_read_failure();
                warn!(
                    reader = %self.label,
                    db = self.db_number,
                    expected = self.db_size,
                    received = block.len(),
                    "Short block read, dropping controller session"
                );
                self.release().await;
                None
            },
            Ok(block) => {
                self.stats.record_read(block.len());
                Some(self.channels.decode(&block, Utc::now()))
            },
            Err(e) => {
                self.stats.record_read_failure();
                warn!(
                    reader = %self.label,
                    db = self.db_number,
                    error = %e,
                    "Block read failed, dropping controller session"
                );
                self.release().await;
                None
            },
        }
    }

    async fn release(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.disconnect().await {
                debug!(reader = %self.label, error = %e, "Error closing controller session");
            }
        }
        if self.state == ConnectionState::Connected {
            self.stats.record_disconnection();
        }
        self.state = ConnectionState::Disconnected;
    }
}
