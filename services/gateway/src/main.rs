//! Telemetry gateway service
//!
//! Exit codes: 0 after a clean shutdown, 1 when configuration is invalid or
//! the broker stays unreachable for the whole initial retry budget.

use clap::Parser;
use tracing::{error, info};

use gateway::bootstrap::{self, Args};
use gateway::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logging is not up yet, so configuration errors go to stderr
    let config = match bootstrap::load_configuration(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gateway: {e}");
            std::process::exit(1);
        },
    };

    if args.print_config {
        print!("{}", bootstrap::render_configuration(&config)?);
        return Ok(());
    }

    bootstrap::initialize_logging(&config, &args)?;
    let path = args.config_path()?;
    bootstrap::describe_configuration(&config, &path);

    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let cancel = common::shutdown::shutdown_token();
    let gateway = Gateway::new(config)?;

    match gateway.run(cancel).await {
        Ok(summary) => {
            info!(
                history_publishes = summary.history.publishes,
                realtime_publishes = summary.realtime.publishes,
                "Gateway exited cleanly"
            );
            Ok(())
        },
        Err(e) => {
            error!(fatal = e.is_fatal(), "Gateway failed: {e}");
            std::process::exit(1);
        },
    }
}
