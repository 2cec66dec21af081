//! S7 transport over ISO-on-TCP
//!
//! Opens a TCP session on port 102, negotiates the PDU length and reads data
//! blocks in chunks that fit it. Any I/O failure drops the socket; the next
//! `connect()` happens on a fresh instance.

pub mod frame;

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::traits::{ControllerTransport, TransportError};
use crate::config::ControllerConfig;

/// S7 session parameters
#[derive(Debug, Clone)]
pub struct S7Config {
    pub address: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    /// Applied to connect and to every request/response exchange
    pub timeout: Duration,
}

impl Default for S7Config {
    fn default() -> Self {
        Self {
            address: "192.168.0.1".to_string(),
            port: 102,
            rack: 0,
            slot: 1,
            timeout: Duration::from_secs(3),
        }
    }
}

impl From<&ControllerConfig> for S7Config {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            address: config.address.clone(),
            port: config.port,
            rack: config.rack,
            slot: config.slot,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

/// S7 transport implementation
#[derive(Debug)]
pub struct S7Transport {
    config: S7Config,
    stream: Option<TcpStream>,
    pdu_length: u16,
    pdu_ref: u16,
}

impl S7Transport {
    pub fn new(config: S7Config) -> Self {
        Self {
            config,
            stream: None,
            pdu_length: 0,
            pdu_ref: 0,
        }
    }

    /// PDU length agreed with the CPU, zero before connect
    pub fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    fn socket_addr(&self) -> String {
        format!("{}:{}", self.config.address, self.config.port)
    }

    fn next_pdu_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    /// Send one frame and read back one TPKT frame
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let limit = self.config.timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let result = timeout(limit, async {
            stream.write_all(request).await?;

            let mut header = [0u8; frame::TPKT_LEN];
            stream.read_exact(&mut header).await?;
            let total = frame::tpkt_length(&header)?;

            let mut response = vec![0u8; total];
            response[..frame::TPKT_LEN].copy_from_slice(&header);
            stream.read_exact(&mut response[frame::TPKT_LEN..]).await?;
            Ok::<_, TransportError>(response)
        })
        .await;

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.drop_stream();
                Err(e)
            },
            Err(_) => {
                self.drop_stream();
                Err(TransportError::Timeout(format!(
                    "no answer from {} within {:?}",
                    self.socket_addr(),
                    limit
                )))
            },
        }
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.pdu_length = 0;
    }

    async fn handshake(&mut self) -> Result<(), TransportError> {
        let response = self
            .exchange(&frame::connection_request(self.config.rack, self.config.slot))
            .await?;
        frame::check_connection_confirm(&response)?;

        let pdu_ref = self.next_pdu_ref();
        let response = self
            .exchange(&frame::setup_communication(pdu_ref, frame::REQUESTED_PDU))
            .await?;
        self.pdu_length = frame::parse_setup_response(&response)?;
        Ok(())
    }
}

#[async_trait]
impl ControllerTransport for S7Transport {
    fn transport_type(&self) -> &str {
        "s7"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.drop_stream();

        let addr = self.socket_addr();
        debug!("Connecting to S7 endpoint: {addr}");

        let stream = match timeout(self.config.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "Failed to connect to {addr}: {e}"
                )))
            },
            Err(_) => {
                return Err(TransportError::Timeout(format!(
                    "Connection to {addr} timed out"
                )))
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {e}");
        }
        self.stream = Some(stream);

        if let Err(e) = self.handshake().await {
            self.drop_stream();
            return Err(match e {
                TransportError::Timeout(msg) => TransportError::Timeout(msg),
                other => TransportError::ConnectionFailed(format!(
                    "S7 handshake with {addr} failed: {other}"
                )),
            });
        }

        info!(
            "Connected to S7 CPU {} (rack {}, slot {}, PDU {})",
            addr, self.config.rack, self.config.slot, self.pdu_length
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error during S7 socket shutdown: {e}");
            }
            info!("Disconnected from S7 endpoint {}", self.socket_addr());
        }
        self.pdu_length = 0;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_block(
        &mut self,
        db: u16,
        start: u32,
        len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        if self.stream.is_none() {
            return Err(TransportError::NotConnected);
        }

        let chunk = usize::from(self.pdu_length).saturating_sub(frame::READ_OVERHEAD);
        if chunk == 0 {
            return Err(TransportError::Protocol("PDU length not negotiated".to_string()));
        }

        let mut data = Vec::with_capacity(len);
        let mut offset = 0usize;
        while offset < len {
            let size = chunk.min(len - offset);
            let pdu_ref = self.next_pdu_ref();
            let request =
                frame::read_var_request(pdu_ref, db, start + offset as u32, size as u16);

            let response = self.exchange(&request).await.map_err(|e| match e {
                TransportError::Timeout(msg) => TransportError::Timeout(msg),
                other => TransportError::ReadFailed(other.to_string()),
            })?;

            match frame::parse_read_response(&response, size) {
                Ok(part) => data.extend_from_slice(&part),
                Err(e) => {
                    // The session may be out of step with the CPU
                    self.drop_stream();
                    return Err(e);
                },
            }
            offset += size;
        }

        debug!(db, start, len, "S7 block read");
        Ok(data)
    }
}
