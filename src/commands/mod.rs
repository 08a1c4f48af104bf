mod plugins;
mod price;

pub use plugins::plugins_command;
pub use price::{AccuracyArg, OutputFormat, PriceArgs, price_command};

use anyhow::{Context, Result};
use costhost::HostConfig;
use std::path::Path;

/// Host configuration from an optional file, with CLI overrides applied
pub fn load_host_config(path: Option<&Path>, call_timeout_ms: Option<u64>) -> Result<HostConfig> {
    let mut config = match path {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    if let Some(ms) = call_timeout_ms {
        config.call_timeout_ms = ms;
    }
    config
        .validate()
        .context("Invalid host configuration after applying command-line overrides")?;
    Ok(config)
}
