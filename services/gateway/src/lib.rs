//! Telemetry gateway
//!
//! Polls temperature channels from an S7 controller and republishes them over
//! MQTT at two cadences: a retained history stream that always runs, and a
//! real-time stream switched on and off by START/STOP on a control topic.
//!
//! ```text
//! ControllerReader ─► PollLoop (history)  ─┐
//! ControllerReader ─► PollLoop (realtime) ─┼─► BusClient ─► broker
//!                          ▲               │
//!                     ControlGate ◄── dispatch_commands ◄── control topic
//! ```

pub mod bootstrap;
pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod gate;
pub mod reader;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod transport;

pub use channel::{Channel, ChannelMap, Reading};
pub use config::GatewayConfig;
pub use error::{ConnectError, GatewayError, Result};
pub use gate::ControlGate;
pub use reader::{ConnectionState, ControllerReader};
pub use service::{Gateway, GatewaySummary};
