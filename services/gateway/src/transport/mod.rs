//! Controller transport layer
//!
//! ```text
//! ┌───────────────────────────────┐
//! │       ControllerReader        │
//! └───────────────────────────────┘
//!                │
//!                ▼
//! ┌───────────────────────────────┐
//! │  ControllerTransport (trait)  │
//! │  connect(), read_block() ...  │
//! └───────────────────────────────┘
//!         │               │
//!         ▼               ▼
//!   ┌───────────┐   ┌───────────┐
//!   │    S7     │   │ Simulated │
//!   │ ISO-on-TCP│   │ controller│
//!   └───────────┘   └───────────┘
//! ```

pub mod s7;
pub mod simulated;
pub mod traits;

use std::sync::Arc;

pub use s7::{S7Config, S7Transport};
pub use simulated::{SimulatedConfig, SimulatedTransport};
pub use traits::{ControllerTransport, TransportBuilder, TransportError, TransportStats};

use crate::channel::ChannelMap;
use crate::config::{ControllerConfig, ControllerMode};

/// Build the transport factory selected by configuration
pub fn builder_from_config(
    config: &ControllerConfig,
    channels: Arc<ChannelMap>,
) -> Arc<dyn TransportBuilder> {
    match config.mode {
        ControllerMode::S7 => {
            let s7 = S7Config::from(config);
            Arc::new(move || -> Result<Box<dyn ControllerTransport>, TransportError> {
                Ok(Box::new(S7Transport::new(s7.clone())))
            })
        },
        ControllerMode::Simulated => {
            let sim = SimulatedConfig {
                db_size: config.db_size,
                min: config.simulated_min,
                max: config.simulated_max,
            };
            Arc::new(move || -> Result<Box<dyn ControllerTransport>, TransportError> {
                Ok(Box::new(SimulatedTransport::new(
                    sim.clone(),
                    Arc::clone(&channels),
                )))
            })
        },
    }
}
