//! Daemon configuration
//!
//! Layered: serde defaults, then an optional config file, then
//! `AUTOSCALER_*` environment variables with `__` between nested keys,
//! e.g. `AUTOSCALER_AUTOSCALE__SLOTS_MIN_SPARE=2`.

use anyhow::{Context, Result};
use autoscaler_lib::{AutoscaleConfig, SwarmConfig};
use serde::Deserialize;
use std::path::Path;

const ENV_PREFIX: &str = "AUTOSCALER";

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Port of the health/metrics server, 0 to disable it
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default)]
    pub autoscale: AutoscaleConfig,

    #[serde(default)]
    pub swarm: SwarmConfig,
}

fn default_api_port() -> u16 {
    8080
}

impl DaemonConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: DaemonConfig = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        config.autoscale.validate()?;
        Ok(config)
    }
}
