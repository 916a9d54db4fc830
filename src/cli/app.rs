use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use super::config::cmd_config;
use super::env::{CliArgs, Commands};
use super::runtime::init_logging;
use super::serve::cmd_serve;
use crate::config::{load_config, LoadedConfig};

pub async fn run() -> Result<()> {
    let cli = CliArgs::parse();

    let LoadedConfig {
        config,
        path,
        from_file,
    } = load_config(cli.config.as_deref()).await?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(level, cli.debug, cli.json_logs || config.log_json)?;

    info!(
        "Starting SoulBridge v{} ({}@{}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_BRANCH"),
        env!("GIT_HASH"),
        env!("BUILD_DATE")
    );
    if from_file {
        info!("Loaded configuration from: {}", path.display());
    } else {
        warn!("Config file not found, using defaults: {}", path.display());
    }

    let outcome = match cli.command {
        Commands::Serve(args) => cmd_serve(args, config).await,
        Commands::Config(args) => cmd_config(args, &config, &path),
    };

    match outcome {
        Ok(()) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(err) => {
            error!("Command failed: {}", err);
            Err(err)
        }
    }
}
