//! Swarm Autoscaler - keeps a Docker Swarm sized to its services
//!
//! Runs next to a swarm manager, polling the swarm and calling the
//! configured provisioning commands to add or remove worker nodes.

use anyhow::Result;
use autoscaler_lib::{
    health::HealthRegistry,
    observability::{AutoscalerMetrics, StructuredLogger},
    AutoscaleManagerBuilder, RunOutcome, SwarmCli,
};
use clap::Parser;
use crate::config::{DaemonConfig, LogFormat};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AUTOSCALER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Docker Swarm fleet autoscaler
#[derive(Debug, Parser)]
#[command(name = "swarm-autoscaler", version, about)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "AUTOSCALER_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Port of the health/metrics server, 0 to disable it
    #[arg(long)]
    api_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(format) = args.log_format {
        config.log_format = format;
    }
    if let Some(port) = args.api_port {
        config.api_port = port;
    }

    init_tracing(config.log_format);
    info!("Starting swarm-autoscaler");

    let health_registry = HealthRegistry::new();
    let metrics = AutoscalerMetrics::new();

    let cluster = config
        .swarm
        .docker_host
        .clone()
        .unwrap_or_else(|| "local".to_string());
    let logger = StructuredLogger::new(cluster);
    logger.log_startup(AUTOSCALER_VERSION, config.autoscale.poll_interval);

    let manager = AutoscaleManagerBuilder::new(config.autoscale.clone())
        .container(Arc::new(SwarmCli::new(config.swarm.clone())))
        .per_service_constraints(config.swarm.per_service_constraints())
        .health(health_registry.clone())
        .logger(logger.clone())
        .build()?;

    if config.api_port != 0 {
        let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
        let port = config.api_port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(port, app_state).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    health_registry.set_ready(true).await;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let signal_logger = logger.clone();
    tokio::spawn(async move {
        let reason = shutdown_signal().await;
        signal_logger.log_shutdown(reason);
        let _ = shutdown_tx.send(());
    });

    match manager
        .run(config.autoscale.poll_interval(), shutdown_rx)
        .await
    {
        Ok(RunOutcome::Shutdown) => Ok(()),
        Ok(RunOutcome::IdleTermination) => {
            logger.log_shutdown("swarm idle");
            Ok(())
        }
        Err(e) => {
            logger.log_shutdown("fatal error");
            Err(e.into())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
