use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use remote_bridge::RemoteBridge;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use crate::config::Config;
use crate::metrics;

#[derive(Args, Clone, Debug, Default)]
pub struct ServeArgs {
    /// Address for browser connections and the caller API
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Metrics server port (set to 0 to disable)
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Timeout for commands that do not name one, e.g. `30s` or `2m`
    #[arg(long, value_parser = humantime::parse_duration)]
    pub default_timeout: Option<Duration>,

    /// Commands allowed in flight per tenant (0 = unbounded)
    #[arg(long)]
    pub max_in_flight: Option<u32>,
}

pub fn apply_serve_overrides(args: &ServeArgs, config: &mut Config) -> Result<()> {
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }
    if let Some(timeout) = args.default_timeout {
        config.bridge.default_timeout_ms = timeout.as_millis() as u64;
    }
    if let Some(limit) = args.max_in_flight {
        config.bridge.max_in_flight_per_tenant = limit;
    }
    config.validate()
}

pub async fn cmd_serve(args: ServeArgs, mut config: Config) -> Result<()> {
    apply_serve_overrides(&args, &mut config)?;

    let bridge =
        RemoteBridge::new(config.bridge.clone()).context("invalid bridge configuration")?;
    let _metrics_server = metrics::spawn_metrics_server(config.metrics_port);
    let sweeper = bridge.spawn_sweeper();

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(
        addr = %config.bind,
        max_in_flight = config.bridge.max_in_flight_per_tenant,
        default_timeout_ms = config.bridge.default_timeout_ms,
        "bridge listening; browsers connect to ws://{}/bridge/<tenant>",
        config.bind
    );

    let stopper = bridge.clone();
    axum::serve(listener, bridge.clone().build().into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown requested; closing tenant connections");
            stopper.shutdown();
        })
        .await
        .context("Bridge server exited with error")?;

    bridge.shutdown();
    if let Err(err) = sweeper.await {
        error!(?err, "sweeper task failed");
    }
    info!(pending = bridge.pending().len(), "bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(?err, "failed to listen for ctrl-c");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_bridge::BridgeError;

    #[test]
    fn flags_override_config() {
        let args = ServeArgs {
            bind: Some("0.0.0.0:9999".parse().unwrap()),
            metrics_port: Some(0),
            default_timeout: Some(humantime::parse_duration("5s").unwrap()),
            max_in_flight: Some(4),
        };
        let mut config = Config::default();
        apply_serve_overrides(&args, &mut config).unwrap();
        assert_eq!(config.bind.port(), 9999);
        assert_eq!(config.metrics_port, 0);
        assert_eq!(config.bridge.default_timeout_ms, 5_000);
        assert_eq!(config.bridge.max_in_flight_per_tenant, 4);
    }

    #[test]
    fn timeout_above_maximum_is_rejected() {
        let args = ServeArgs {
            default_timeout: Some(humantime::parse_duration("1h").unwrap()),
            ..ServeArgs::default()
        };
        let mut config = Config::default();
        let err = apply_serve_overrides(&args, &mut config).unwrap_err();
        let cause = err.downcast_ref::<BridgeError>().unwrap();
        assert_eq!(cause.code(), "INVALID_ARGUMENT");
    }
}
