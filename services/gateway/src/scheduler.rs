//! Dual-cadence publish scheduler
//!
//! The history loop runs unconditionally and publishes retained messages.
//! The real-time loop parks on the [`ControlGate`] until START and publishes
//! non-retained messages. Each loop owns its own [`ControllerReader`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{ReadingMessage, ReadingPublisher};
use crate::channel::Reading;
use crate::config::channel_topic;
use crate::gate::ControlGate;
use crate::reader::ControllerReader;

/// Which readings of a tick get published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPolicy {
    /// Only connected channels with a value
    #[default]
    PresentOnly,
    /// Every channel; absent values go out as `null`
    All,
}

impl PublishPolicy {
    pub fn admits(&self, reading: &Reading) -> bool {
        match self {
            Self::PresentOnly => reading.is_present(),
            Self::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    History,
    Realtime,
}

impl Cadence {
    pub fn retained(&self) -> bool {
        matches!(self, Self::History)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::History => "history",
            Self::Realtime => "realtime",
        }
    }
}

/// Per-loop counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    /// Decoded readings, publishable or not
    pub readings: u64,
    pub publishes: u64,
    pub publish_failures: u64,
    /// Ticks that produced no data
    pub missed_reads: u64,
}

/// Result of one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Controller unreachable or read failed
    NoData,
    Published {
        published: usize,
        failed: usize,
        /// Left out because the gate closed mid-tick
        skipped: usize,
    },
}

/// One publish loop
pub struct PollLoop {
    cadence: Cadence,
    reader: ControllerReader,
    publisher: Arc<dyn ReadingPublisher>,
    topic_template: String,
    period: Duration,
    policy: PublishPolicy,
    gate: Option<ControlGate>,
    stats: LoopStats,
}

impl PollLoop {
    /// Always-on retained loop
    pub fn history(
        reader: ControllerReader,
        publisher: Arc<dyn ReadingPublisher>,
        topic_template: impl Into<String>,
        period: Duration,
        policy: PublishPolicy,
    ) -> Self {
        Self {
            cadence: Cadence::History,
            reader,
            publisher,
            topic_template: topic_template.into(),
            period,
            policy,
            gate: None,
            stats: LoopStats::default(),
        }
    }

    /// Gated non-retained loop
    pub fn realtime(
        reader: ControllerReader,
        publisher: Arc<dyn ReadingPublisher>,
        topic_template: impl Into<String>,
        period: Duration,
        gate: ControlGate,
    ) -> Self {
        Self {
            cadence: Cadence::Realtime,
            reader,
            publisher,
            topic_template: topic_template.into(),
            period,
            policy: PublishPolicy::PresentOnly,
            gate: Some(gate),
            stats: LoopStats::default(),
        }
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn reader(&self) -> &ControllerReader {
        &self.reader
    }

    fn gate_closed(&self) -> bool {
        self.gate.as_ref().is_some_and(|gate| !gate.is_active())
    }

    /// Read once and publish what the policy admits
    pub async fn tick(&mut self) -> TickOutcome {
        let cadence = self.cadence.name();
        self.stats.ticks += 1;

        if let Err(e) = self.reader.ensure_connection().await {
            self.stats.missed_reads += 1;
            warn!(cadence, error = %e, "No controller connection, retrying in {:?}", self.period);
            return TickOutcome::NoData;
        }

        let Some(readings) = self.reader.read_all().await else {
            self.stats.missed_reads += 1;
            warn!(cadence, "No data from controller, retrying in {:?}", self.period);
            return TickOutcome::NoData;
        };
        self.stats.readings += readings.len() as u64;

        let admitted: Vec<&Reading> = readings.iter().filter(|r| self.policy.admits(r)).collect();
        let mut published = 0;
        let mut failed = 0;

        for (index, reading) in admitted.iter().enumerate() {
            if self.gate_closed() {
                let skipped = admitted.len() - index;
                debug!(cadence, skipped, "Gate closed mid-tick");
                return TickOutcome::Published {
                    published,
                    failed,
                    skipped,
                };
            }

            let topic = channel_topic(&self.topic_template, &reading.channel);
            let payload = match ReadingMessage::from_reading(reading).to_json() {
                Ok(payload) => payload,
                Err(e) => {
                    failed += 1;
                    self.stats.publish_failures += 1;
                    warn!(cadence, channel = %reading.channel, error = %e, "Payload encoding failed");
                    continue;
                },
            };

            match self
                .publisher
                .publish(&topic, payload, self.cadence.retained())
                .await
            {
                Ok(()) => {
                    published += 1;
                    self.stats.publishes += 1;
                    debug!(cadence, topic = %topic, value = ?reading.value, "Published");
                },
                Err(e) => {
                    failed += 1;
                    self.stats.publish_failures += 1;
                    warn!(cadence, topic = %topic, error = %e, "Publish failed");
                },
            }
        }

        TickOutcome::Published {
            published,
            failed,
            skipped: 0,
        }
    }

    /// Loop until `cancel` fires; closes the controller session on exit
    pub async fn run(mut self, cancel: CancellationToken) -> LoopStats {
        let cadence = self.cadence.name();
        info!(cadence, period = ?self.period, reader = self.reader.label(), "Poll loop started");

        let gate = self.gate.clone();
        loop {
            if let Some(gate) = &gate {
                if !gate.is_active() {
                    debug!(cadence, "Waiting for START");
                }
                if !gate.wait_until_active(&cancel).await {
                    break;
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.tick() => {},
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {},
            }
        }

        self.reader.disconnect().await;
        info!(
            cadence,
            ticks = self.stats.ticks,
            readings = self.stats.readings,
            publishes = self.stats.publishes,
            publish_failures = self.stats.publish_failures,
            missed_reads = self.stats.missed_reads,
            "Poll loop stopped"
        );
        self.stats
    }
}

/// Both publish loops
pub struct ReadingScheduler {
    history: PollLoop,
    realtime: PollLoop,
}

impl ReadingScheduler {
    pub fn new(history: PollLoop, realtime: PollLoop) -> Self {
        Self { history, realtime }
    }

    /// Spawn both loops as independent tasks
    pub fn spawn(self, cancel: &CancellationToken) -> SchedulerHandles {
        SchedulerHandles {
            history: tokio::spawn(self.history.run(cancel.clone())),
            realtime: tokio::spawn(self.realtime.run(cancel.clone())),
        }
    }
}

/// Join handles of the spawned loops
pub struct SchedulerHandles {
    pub history: tokio::task::JoinHandle<LoopStats>,
    pub realtime: tokio::task::JoinHandle<LoopStats>,
}

impl SchedulerHandles {
    /// Wait for both loops; a panicked loop reports empty stats
    pub async fn join(self) -> (LoopStats, LoopStats) {
        let (history, realtime) = tokio::join!(self.history, self.realtime);
        let unwrap = |cadence: &str, result: Result<LoopStats, tokio::task::JoinError>| {
            result.unwrap_or_else(|e| {
                warn!(cadence, error = %e, "Poll loop task failed");
                LoopStats::default()
            })
        };
        (unwrap("history", history), unwrap("realtime", realtime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(connected: bool, value: Option<f64>) -> Reading {
        Reading {
            channel: "Linea 1".to_string(),
            connected,
            value,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_publish_policy() {
        let present = reading(true, Some(701.2));
        let absent = reading(false, None);

        assert!(PublishPolicy::PresentOnly.admits(&present));
        assert!(!PublishPolicy::PresentOnly.admits(&absent));
        assert!(PublishPolicy::All.admits(&absent));
    }

    #[test]
    fn test_policy_serde_names() {
        let policy: PublishPolicy = serde_json::from_str("\"present_only\"").unwrap();
        assert_eq!(policy, PublishPolicy::PresentOnly);
        let policy: PublishPolicy = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(policy, PublishPolicy::All);
    }

    #[test]
    fn test_cadence_retain() {
        assert!(Cadence::History.retained());
        assert!(!Cadence::Realtime.retained());
        assert_eq!(Cadence::Realtime.name(), "realtime");
    }
}
