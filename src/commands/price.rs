use anyhow::{Context, Result, bail};
use colored::Colorize;
use costhost::cost::{Confidence, CostReport, ResourceRequest};
use costhost::plugin::PluginRegistry;
use costhost::{Accuracy, CostRequest, Credentials, HostConfig, PluginHost, PricingContext};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum AccuracyArg {
    Projected,
    Actual,
}

impl From<AccuracyArg> for Accuracy {
    fn from(arg: AccuracyArg) -> Self {
        match arg {
            AccuracyArg::Projected => Accuracy::Projected,
            AccuracyArg::Actual => Accuracy::Actual,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    Json,
    Summary,
}

pub struct PriceArgs {
    pub registry: PathBuf,
    pub resources: PathBuf,
    pub credentials: String,
    pub accuracy: AccuracyArg,
    pub deadline_ms: Option<u64>,
    pub format: OutputFormat,
}

/// Resource list as produced by the plan collaborator
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceFile {
    resources: Vec<ResourceRequest>,
}

pub async fn price_command(config: HostConfig, args: PriceArgs) -> Result<()> {
    let registry = PluginRegistry::load(&args.registry)?;
    let resources = load_resources(&args.resources)?;
    let credentials = parse_credentials(&args.credentials)?;

    let mut request = CostRequest::new(resources);
    if let Some(ms) = args.deadline_ms {
        request = request.with_deadline(Duration::from_millis(ms));
    }
    let context = PricingContext::new(credentials, args.accuracy.into());

    let host = PluginHost::start(config, &registry).await?;
    let result = host.price(&request, &context).await;
    host.shutdown().await;
    let report = result.context("Pricing failed")?;

    match args.format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
            println!("{json}");
        }
        OutputFormat::Summary => print_summary(&report),
    }

    Ok(())
}

fn load_resources(path: &Path) -> Result<Vec<ResourceRequest>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read resource list {}", path.display()))?;
    // YAML is a superset of the JSON we accept here
    let file: ResourceFile = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse resource list {}", path.display()))?;
    Ok(file.resources)
}

/// `none`, `all`, or a comma-separated list of provider prefixes
pub fn parse_credentials(raw: &str) -> Result<Credentials> {
    let raw = raw.trim();
    match raw {
        "" | "none" => Ok(Credentials::None),
        "all" => Ok(Credentials::All),
        _ => {
            let providers: BTreeSet<String> = raw
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if providers.is_empty() {
                bail!("No providers in credentials list '{raw}'");
            }
            Ok(Credentials::Providers(providers))
        }
    }
}

fn print_summary(report: &CostReport) {
    println!("{}", "Cost report".bold());
    for entry in report.entries() {
        let resource = &entry.resource;
        match entry.result.estimate() {
            Some(estimate) => {
                let served = entry
                    .served_by
                    .as_ref()
                    .map(|s| format!(" via {} ({})", s.plugin, s.tier))
                    .unwrap_or_default();
                let flag = if estimate.confidence == Confidence::Substitute {
                    " [substitute]".yellow().to_string()
                } else {
                    String::new()
                };
                println!(
                    "  {} {} {}{served}{flag}",
                    "✓".green(),
                    resource.id,
                    format!("{:.2} {}", estimate.amount, estimate.currency).green()
                );
            }
            None => {
                let reason = entry
                    .result
                    .unpriced_reason()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                println!("  {} {} {}", "✗".red(), resource.id, reason.yellow());
            }
        }
    }

    let unpriced = report.unpriced().count();
    println!();
    for (currency, total) in report.totals() {
        println!("  {} {total:.2} {currency}", "Total:".bold());
    }
    if unpriced > 0 {
        println!("  {unpriced} of {} resource(s) unpriced", report.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_credentials() {
        assert_eq!(parse_credentials("none").unwrap(), Credentials::None);
        assert_eq!(parse_credentials("").unwrap(), Credentials::None);
        assert_eq!(parse_credentials("all").unwrap(), Credentials::All);
        assert_eq!(
            parse_credentials("aws, gcp").unwrap(),
            Credentials::Providers(["aws".to_string(), "gcp".to_string()].into())
        );
        assert!(parse_credentials(",").is_err());
    }
}
