//! Gateway basic library
//!
//! Provides functions shared by the gateway service and its tools:
//! - logging bootstrap
//! - graceful shutdown signalling

pub mod logging;
pub mod shutdown;

// Re-export common dependencies
pub use tokio;
pub use tokio_util::sync::CancellationToken;
