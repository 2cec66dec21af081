//! Service bootstrap
//!
//! Command-line arguments, configuration loading and logging setup for the
//! `gateway` binary.

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{ControllerMode, GatewayConfig, DEFAULT_CONFIG_PATH};
use crate::error::{GatewayError, Result};

/// Command-line arguments for the gateway
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gateway",
    version = env!("CARGO_PKG_VERSION"),
    about = "Controller to MQTT telemetry gateway",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML); the default location may be absent
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    pub print_config: bool,

    /// Use the simulated controller instead of a real CPU
    #[arg(long)]
    pub simulate: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

impl Args {
    /// Resolve the configuration file; an explicit path must exist
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) if !path.is_file() => Err(GatewayError::config(format!(
                "configuration file {} not found",
                path.display()
            ))),
            Some(path) => Ok(path.clone()),
            None => Ok(PathBuf::from(DEFAULT_CONFIG_PATH)),
        }
    }
}

/// Load configuration and apply command-line overrides
pub fn load_configuration(args: &Args) -> Result<GatewayConfig> {
    let path = args.config_path()?;
    let mut config = GatewayConfig::load(&path)?;

    if args.simulate {
        config.controller.mode = ControllerMode::Simulated;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    Ok(config)
}

/// Initialize logging from the loaded configuration
pub fn initialize_logging(config: &GatewayConfig, args: &Args) -> Result<()> {
    let log_config = common::logging::LogConfig {
        service_name: "gateway".to_string(),
        log_dir: config.logging.dir.clone(),
        level: common::logging::parse_level(&config.logging.level),
        enable_json: config.logging.json,
        ansi: !args.no_color,
    };

    common::logging::init_with_config(log_config)
        .map_err(|e| GatewayError::config(format!("Failed to init logging: {e}")))
}

/// Effective configuration as YAML, password masked
pub fn render_configuration(config: &GatewayConfig) -> Result<String> {
    let mut shown = config.clone();
    if shown.bus.password.is_some() {
        shown.bus.password = Some("********".to_string());
    }
    serde_yaml::to_string(&shown)
        .map_err(|e| GatewayError::config(format!("Failed to render configuration: {e}")))
}

/// Log a summary of what the gateway would run with
pub fn describe_configuration(config: &GatewayConfig, path: &Path) {
    let c = &config.controller;
    info!("Configuration: {}", path.display());
    match c.mode {
        ControllerMode::S7 => info!(
            "Controller: S7 {}:{} rack {} slot {} DB{} ({} bytes)",
            c.address, c.port, c.rack, c.slot, c.db_number, c.db_size
        ),
        ControllerMode::Simulated => info!(
            "Controller: simulated, {:.1}-{:.1} ({} bytes)",
            c.simulated_min, c.simulated_max, c.db_size
        ),
    }
    info!("Found {} channel(s)", config.channels.len());
    for channel in &config.channels {
        info!(
            "  {}: value @{} flag @{}.{}",
            channel.name, channel.value_offset, channel.connected_offset, channel.connected_bit
        );
    }

    let b = &config.bus;
    info!(
        "Broker: {}:{} as {} (tls: {}, auth: {})",
        b.host,
        b.port,
        b.client_id,
        b.ca_path.is_some(),
        b.username.is_some()
    );
    info!(
        "Topics: history={} realtime={} control={}",
        config.topics.history, config.topics.realtime, config.topics.control
    );
    info!(
        "Schedule: history every {}s ({:?}), realtime every {}s",
        config.schedule.history_interval_secs,
        config.schedule.history_policy,
        config.schedule.realtime_interval_secs
    );
}
