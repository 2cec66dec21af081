//! Gateway MQTT connection
//!
//! [`BusClient::new`] splits the connection in two:
//!
//! - [`BusClient`]: cheap clonable handle used to publish; never blocks
//! - [`BusConnection`]: owns the rumqttc event loop; connects, reconnects,
//!   subscribes to the control topic and forwards commands
//!
//! Commands arrive on the returned receiver and are applied to the
//! [`ControlGate`] by [`dispatch_commands`].

use async_trait::async_trait;
use parking_lot::RwLock;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, Outgoing, QoS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{mqtt_options, qos, BusError, ControlCommand, ReadingPublisher};
use crate::config::{BusConfig, Topics};
use crate::gate::ControlGate;
use crate::retry::{RetryError, RetryPolicy, RetryState};

/// Request queue depth between the handle and the event loop
const REQUEST_CAPACITY: usize = 64;
/// Commands buffered between the event loop and the gate
const COMMAND_CAPACITY: usize = 16;
/// Time allowed for a clean DISCONNECT on shutdown
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Broker session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Publishing handle
#[derive(Clone)]
pub struct BusClient {
    client: AsyncClient,
    state: Arc<RwLock<BusConnectionState>>,
    qos: QoS,
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("state", &*self.state.read())
            .field("qos", &self.qos)
            .finish()
    }
}

/// Event-loop side of the connection
pub struct BusConnection {
    eventloop: EventLoop,
    client: AsyncClient,
    state: Arc<RwLock<BusConnectionState>>,
    broker: String,
    control_topic: String,
    commands: mpsc::Sender<ControlCommand>,
    reconnect: RetryPolicy,
    connect_timeout: Duration,
}

impl BusClient {
    /// Build both halves; no network I/O happens until the connection is polled
    pub fn new(
        config: &BusConfig,
        topics: &Topics,
    ) -> Result<(BusClient, BusConnection, mpsc::Receiver<ControlCommand>), BusError> {
        let options = mqtt_options(config, &config.client_id)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let state = Arc::new(RwLock::new(BusConnectionState::Disconnected));
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);

        let handle = BusClient {
            client: client.clone(),
            state: Arc::clone(&state),
            qos: qos(config.qos),
        };
        let connection = BusConnection {
            eventloop,
            client,
            state,
            broker: format!("{}:{}", config.host, config.port),
            control_topic: topics.control.clone(),
            commands,
            reconnect: RetryPolicy::unbounded_exponential(
                config.reconnect_min_delay(),
                config.reconnect_max_delay(),
            )
            .with_jitter(true),
            connect_timeout: config.connect_timeout(),
        };

        Ok((handle, connection, rx))
    }

    pub fn state(&self) -> BusConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == BusConnectionState::Connected
    }

    /// Queue one publish
    ///
    /// Fails with [`BusError::NotConnected`] while offline and with
    /// [`BusError::Client`] when the request queue is full.
    pub fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.client.try_publish(topic, self.qos, retain, payload)?;
        trace!(topic, retain, "Publish queued");
        Ok(())
    }
}

#[async_trait]
impl ReadingPublisher for BusClient {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retained: bool,
    ) -> Result<(), BusError> {
        BusClient::publish(self, topic, payload, retained)
    }
}

impl BusConnection {
    pub fn state(&self) -> BusConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: BusConnectionState) {
        *self.state.write() = state;
    }

    /// Initial connect: try until CONNACK or until `policy` is spent
    pub async fn connect_with_retry(
        &mut self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), RetryError> {
        let mut retry = RetryState::new(policy.clone());

        loop {
            let attempt = retry.failures() + 1;
            info!(
                attempt,
                "Connecting to broker {} (attempt {}/{})",
                self.broker,
                attempt,
                policy.describe_budget()
            );

            let error = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = self.connect_once() => match result {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                },
            };

            match retry.next_delay() {
                Some(delay) => {
                    warn!(attempt, error = %error, "Broker connect failed, retrying in {:?}", delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {},
                    }
                },
                None => {
                    warn!(attempt, error = %error, "Broker connect failed, no attempts left");
                    self.set_state(BusConnectionState::Disconnected);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: error.to_string(),
                    });
                },
            }
        }
    }

    /// Poll until CONNACK, an error, or the connect timeout
    async fn connect_once(&mut self) -> Result<(), BusError> {
        self.set_state(BusConnectionState::Connecting);

        let limit = self.connect_timeout;
        let outcome = tokio::time::timeout(limit, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(event @ Event::Incoming(Incoming::ConnAck(_))) => {
                        return Ok(event);
                    },
                    Ok(other) => trace!(?other, "Event before CONNACK"),
                    Err(e) => return Err(BusError::Connection(e.to_string())),
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(event)) => {
                self.handle_event(&event);
                if self.state() == BusConnectionState::Connected {
                    Ok(())
                } else {
                    Err(BusError::Connection("broker refused the session".to_string()))
                }
            },
            Ok(Err(e)) => {
                self.set_state(BusConnectionState::Disconnected);
                Err(e)
            },
            Err(_) => {
                self.set_state(BusConnectionState::Disconnected);
                Err(BusError::Timeout(format!(
                    "no CONNACK from {} within {:?}",
                    self.broker, limit
                )))
            },
        }
    }

    /// Drive the connection until `cancel` fires, reconnecting with backoff
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut retry = RetryState::new(self.reconnect.clone());

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(event) => {
                    if matches!(event, Event::Incoming(Incoming::ConnAck(_))) {
                        retry.reset();
                    }
                    self.handle_event(&event);
                },
                Err(e) => {
                    self.mark_disconnected(&e.to_string());
                    // Unbounded policy always yields a delay
                    let delay = retry
                        .next_delay()
                        .unwrap_or_else(|| self.reconnect.delay_for(retry.failures()));
                    info!(
                        attempt = retry.failures(),
                        "Reconnecting to broker {} in {:?}", self.broker, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {},
                    }
                    self.set_state(BusConnectionState::Connecting);
                },
            }
        }

        self.shutdown().await;
    }

    /// React to one event-loop notification
    pub(crate) fn handle_event(&mut self, event: &Event) {
        match event {
            Event::Incoming(Incoming::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    self.on_connected();
                } else {
                    warn!(code = ?ack.code, "Broker refused connection");
                    self.set_state(BusConnectionState::Disconnected);
                }
            },
            Event::Incoming(Incoming::SubAck(ack)) => {
                debug!(pkid = ack.pkid, return_codes = ?ack.return_codes, "Subscription acknowledged");
            },
            Event::Incoming(Incoming::Publish(publish)) => {
                if publish.topic == self.control_topic {
                    self.forward_command(ControlCommand::parse(&publish.payload));
                } else {
                    debug!(topic = %publish.topic, "Ignoring message on unexpected topic");
                }
            },
            Event::Incoming(Incoming::Disconnect) => {
                self.mark_disconnected("broker sent DISCONNECT");
            },
            other => trace!(?other, "MQTT event"),
        }
    }

    fn on_connected(&mut self) {
        self.set_state(BusConnectionState::Connected);
        info!("Connected to broker {}", self.broker);

        match self
            .client
            .try_subscribe(self.control_topic.as_str(), QoS::AtLeastOnce)
        {
            Ok(()) => info!(topic = %self.control_topic, "Subscribed to control topic"),
            Err(e) => warn!(topic = %self.control_topic, error = %e, "Control subscription failed"),
        }
    }

    fn forward_command(&self, command: ControlCommand) {
        info!(topic = %self.control_topic, command = %command, "Control command received");
        match self.commands.try_send(command) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(command = %dropped, "Command queue full, dropping command");
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Command dispatcher gone, ignoring command");
            },
        }
    }

    /// Record a lost session
    pub(crate) fn mark_disconnected(&self, reason: &str) {
        let previous = std::mem::replace(&mut *self.state.write(), BusConnectionState::Disconnected);
        if previous == BusConnectionState::Connected {
            warn!(reason, "Disconnected from broker {}", self.broker);
        } else {
            debug!(reason, "Broker still unreachable");
        }
    }

    async fn shutdown(&mut self) {
        if self.state() == BusConnectionState::Connected {
            if let Err(e) = self.client.try_disconnect() {
                debug!(error = %e, "Could not queue DISCONNECT");
            } else {
                let eventloop = &mut self.eventloop;
                let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
                    loop {
                        match eventloop.poll().await {
                            Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                            Ok(_) => {},
                        }
                    }
                })
                .await;
                if flushed.is_err() {
                    debug!("DISCONNECT not flushed before timeout");
                }
            }
        }
        self.set_state(BusConnectionState::Disconnected);
        info!("Bus connection closed");
    }
}

/// Apply inbound commands to the gate until `cancel` fires
pub async fn dispatch_commands(
    mut commands: mpsc::Receiver<ControlCommand>,
    gate: ControlGate,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            ControlCommand::Start => {
                if !gate.set() {
                    debug!("START while already active");
                }
            },
            ControlCommand::Stop => {
                if !gate.clear() {
                    debug!("STOP while already idle");
                }
            },
            ControlCommand::Unrecognized(raw) => {
                warn!(payload = %raw, "Unrecognized control command ignored");
            },
        }
    }
    debug!("Command dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish};

    fn connection() -> (BusClient, BusConnection, mpsc::Receiver<ControlCommand>) {
        BusClient::new(&BusConfig::default(), &Topics::default()).unwrap()
    }

    fn connack(code: ConnectReturnCode) -> Event {
        Event::Incoming(Incoming::ConnAck(ConnAck {
            session_present: false,
            code,
        }))
    }

    fn control(payload: &str) -> Event {
        Event::Incoming(Incoming::Publish(Publish::new(
            Topics::default().control,
            QoS::AtLeastOnce,
            payload,
        )))
    }

    #[tokio::test]
    async fn test_publish_fails_fast_while_offline() {
        let (client, _connection, _rx) = connection();
        assert_eq!(client.state(), BusConnectionState::Disconnected);
        assert_eq!(
            client.publish("plcTemperaturas/historial/Linea_1", b"{}".to_vec(), true),
            Err(BusError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_reconnect_resumes_publishing() {
        let (client, mut connection, _rx) = connection();

        connection.handle_event(&connack(ConnectReturnCode::Success));
        assert!(client.is_connected());
        assert!(client.publish("t/a", b"1".to_vec(), false).is_ok());

        connection.mark_disconnected("test");
        assert_eq!(client.publish("t/a", b"2".to_vec(), false), Err(BusError::NotConnected));

        connection.handle_event(&connack(ConnectReturnCode::Success));
        assert!(client.publish("t/a", b"3".to_vec(), false).is_ok());
    }

    #[tokio::test]
    async fn test_refused_connack_stays_offline() {
        let (client, mut connection, _rx) = connection();
        connection.handle_event(&connack(ConnectReturnCode::NotAuthorized));
        assert_eq!(client.state(), BusConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_control_messages_are_forwarded() {
        let (_client, mut connection, mut rx) = connection();

        connection.handle_event(&control("START"));
        connection.handle_event(&control("bogus"));
        connection.handle_event(&Event::Incoming(Incoming::Publish(Publish::new(
            "plcTemperaturas/tiemporeal/Linea_1",
            QoS::AtMostOnce,
            "STOP",
        ))));

        assert_eq!(rx.recv().await, Some(ControlCommand::Start));
        assert_eq!(
            rx.recv().await,
            Some(ControlCommand::Unrecognized("bogus".to_string()))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_applies_last_command() {
        let (tx, rx) = mpsc::channel(8);
        let gate = ControlGate::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(dispatch_commands(rx, gate.clone(), cancel.clone()));

        tx.send(ControlCommand::Start).await.unwrap();
        tx.send(ControlCommand::Unrecognized("PAUSE".to_string())).await.unwrap();
        tx.send(ControlCommand::Stop).await.unwrap();
        tx.send(ControlCommand::Start).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(gate.is_active());
    }

    #[tokio::test]
    async fn test_broker_disconnect_marks_offline() {
        let (client, mut connection, _rx) = connection();
        connection.handle_event(&connack(ConnectReturnCode::Success));
        connection.handle_event(&Event::Incoming(Incoming::Disconnect));
        assert!(!client.is_connected());
    }
}
