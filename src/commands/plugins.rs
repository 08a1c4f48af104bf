use anyhow::{Context, Result};
use colored::Colorize;
use costhost::host::{LifecycleState, PluginStatus};
use costhost::plugin::PluginRegistry;
use costhost::{HostConfig, PluginHost};
use std::path::Path;

use super::OutputFormat;

/// List registered plugins; with `probe`, start them and report negotiation
pub async fn plugins_command(
    config: HostConfig,
    registry_path: &Path,
    probe: bool,
    format: OutputFormat,
) -> Result<()> {
    let registry = PluginRegistry::load(registry_path)?;

    if !probe {
        return match format {
            OutputFormat::Json => {
                let descriptors: Vec<_> = registry.plugins().iter().map(|p| p.as_ref()).collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&descriptors)
                        .context("Failed to serialize registry")?
                );
                Ok(())
            }
            OutputFormat::Summary => {
                println!("Plugins in {}:", registry_path.display());
                if registry.is_empty() {
                    println!("  (none)");
                }
                for plugin in registry.plugins() {
                    let patterns: Vec<_> = plugin
                        .capabilities
                        .patterns()
                        .iter()
                        .map(|p| p.as_str())
                        .collect();
                    println!(
                        "  {} [{}] protocol {} -> {}",
                        plugin.name.bold(),
                        plugin.tier,
                        plugin.protocol_version,
                        patterns.join(", ")
                    );
                }
                Ok(())
            }
        };
    }

    let host = PluginHost::start(config, &registry).await?;
    let statuses = host.plugin_statuses();
    host.shutdown().await;

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&statuses).context("Failed to serialize plugin status")?
        ),
        OutputFormat::Summary => {
            for status in &statuses {
                println!("  {} [{}] {}", status.name.bold(), status.tier, describe(status));
            }
        }
    }
    Ok(())
}

fn describe(status: &PluginStatus) -> String {
    match &status.state {
        LifecycleState::Negotiated => "negotiated".green().to_string(),
        LifecycleState::Incompatible { reason } => format!("{} ({reason})", "incompatible".red()),
        LifecycleState::Failed { reason } => format!("{} ({reason})", "failed".red()),
        LifecycleState::PermanentlyFailed => "permanently failed".red().to_string(),
        other => format!("{other:?}").to_lowercase(),
    }
}
