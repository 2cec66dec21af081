//! Remote control for the telemetry gateway
//!
//! Publishes START or STOP on the gateway's control topic. Each command opens
//! its own broker connection, publishes once and disconnects.
//!
//! ```text
//! remote-control start            # one shot
//! remote-control --config plant.yaml
//! > START
//! > exit
//! ```

mod command;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use command::{Command, PromptInput};
use gateway::config::DEFAULT_CONFIG_PATH;
use gateway::GatewayConfig;

#[derive(Parser, Debug)]
#[command(name = "remote-control")]
#[command(about = "Send START/STOP to the telemetry gateway")]
struct Args {
    /// Gateway configuration file; the broker and control topic come from it
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level for connection diagnostics
    #[arg(short = 'l', long, default_value = "warn")]
    log_level: String,

    /// Send this command and exit; without it an interactive prompt starts
    #[arg(value_enum)]
    command: Option<Command>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    common::logging::init("remote-control", &args.log_level)
        .map_err(|e| anyhow::anyhow!("Failed to init logging: {e}"))?;

    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    debug!(
        "Broker {}:{}, control topic {}",
        config.bus.host, config.bus.port, config.topics.control
    );

    let cancel = common::shutdown::shutdown_token();

    match args.command {
        Some(command) => {
            command::send(&config, command, &cancel)
                .await
                .with_context(|| format!("sending {}", command.payload()))?;
            println!(
                "Command '{}' sent to '{}'",
                command.payload(),
                config.topics.control
            );
            Ok(())
        },
        None => interactive(&config, &cancel).await,
    }
}

/// Prompt loop: START and STOP are sent, EXIT or end of input quits
async fn interactive(config: &GatewayConfig, cancel: &CancellationToken) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("Command (START or STOP), or EXIT to quit: ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        match PromptInput::parse(&line) {
            PromptInput::Send(command) => match command::send(config, command, cancel).await {
                Ok(()) => println!(
                    "Command '{}' sent to '{}'",
                    command.payload(),
                    config.topics.control
                ),
                Err(e) => println!("Error: {e}"),
            },
            PromptInput::Exit => break,
            PromptInput::Empty => {},
            PromptInput::Invalid(word) => println!("Unknown command '{word}', try again"),
        }
    }

    println!();
    Ok(())
}
