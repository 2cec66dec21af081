//! Gateway runtime
//!
//! Startup order: validate config, connect to the broker (bounded retries),
//! then start the bus loop, the command dispatcher and both poll loops.
//! Nothing polls the controller before the broker accepted us.

use std::sync::Arc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{dispatch_commands, BusClient, ReadingPublisher};
use crate::channel::ChannelMap;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::gate::ControlGate;
use crate::reader::ControllerReader;
use crate::retry::{RetryError, RetryPolicy};
use crate::scheduler::{LoopStats, PollLoop, ReadingScheduler};
use crate::transport::{builder_from_config, TransportBuilder};

/// Counters reported when the gateway stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewaySummary {
    pub history: LoopStats,
    pub realtime: LoopStats,
}

/// Assembled gateway, ready to run
pub struct Gateway {
    config: GatewayConfig,
    channels: Arc<ChannelMap>,
    transports: Arc<dyn TransportBuilder>,
}

impl Gateway {
    /// Gateway using the controller backend selected in `config`
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let channels = Arc::new(config.channel_map()?);
        let transports = builder_from_config(&config.controller, Arc::clone(&channels));
        Ok(Self {
            config,
            channels,
            transports,
        })
    }

    /// Gateway with a caller-supplied transport factory
    pub fn with_transport(
        config: GatewayConfig,
        transports: Arc<dyn TransportBuilder>,
    ) -> Result<Self> {
        config.validate()?;
        let channels = Arc::new(config.channel_map()?);
        Ok(Self {
            config,
            channels,
            transports,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Initial broker connect policy
    pub fn initial_connect_policy(&self) -> RetryPolicy {
        let bus = &self.config.bus;
        RetryPolicy::bounded_exponential(
            bus.connection_retries,
            bus.initial_retry_delay(),
            bus.reconnect_max_delay(),
        )
    }

    fn reader(&self, label: &str) -> ControllerReader {
        let controller = &self.config.controller;
        ControllerReader::new(
            label,
            Arc::clone(&self.transports),
            Arc::clone(&self.channels),
            controller.db_number,
            controller.db_size,
        )
    }

    /// Run until `cancel` fires
    ///
    /// Returns an error only when startup fails; once the loops run, every
    /// failure is retried.
    pub async fn run(self, cancel: CancellationToken) -> Result<GatewaySummary> {
        let gate = ControlGate::new();
        let (client, mut connection, commands) =
            BusClient::new(&self.config.bus, &self.config.topics)?;

        match connection
            .connect_with_retry(&self.initial_connect_policy(), &cancel)
            .await
        {
            Ok(()) => {},
            Err(RetryError::Cancelled) => {
                info!("Shutdown requested before the broker connection came up");
                return Ok(GatewaySummary::default());
            },
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                error!(attempts, "Could not reach the broker, giving up");
                return Err(GatewayError::RetriesExhausted {
                    attempts,
                    last_error,
                });
            },
        }

        let publisher: Arc<dyn ReadingPublisher> = Arc::new(client);
        let schedule = &self.config.schedule;
        let topics = &self.config.topics;

        let scheduler = ReadingScheduler::new(
            PollLoop::history(
                self.reader("history"),
                Arc::clone(&publisher),
                topics.history.clone(),
                schedule.history_interval(),
                schedule.history_policy,
            ),
            PollLoop::realtime(
                self.reader("realtime"),
                Arc::clone(&publisher),
                topics.realtime.clone(),
                schedule.realtime_interval(),
                gate.clone(),
            ),
        );

        // Loops stop first so the bus is still up for their last publishes
        let loops_cancel = common::shutdown::child_of(&cancel);
        let bus_cancel = CancellationToken::new();

        let network = tokio::spawn(connection.run(bus_cancel.clone()));
        let dispatcher = tokio::spawn(dispatch_commands(commands, gate, loops_cancel.clone()));
        let loops = scheduler.spawn(&loops_cancel);

        info!(
            history = ?schedule.history_interval(),
            realtime = ?schedule.realtime_interval(),
            "Gateway running"
        );

        let (history, realtime) = loops.join().await;
        report_task_exit("command dispatcher", dispatcher.await);
        bus_cancel.cancel();
        report_task_exit("bus connection", network.await);

        info!("Gateway stopped");
        Ok(GatewaySummary { history, realtime })
    }
}

/// Log a background task that ended by panicking or being aborted
fn report_task_exit(task: &str, result: std::result::Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(task, error = %e, "Background task failed");
            false
        },
    }
}
