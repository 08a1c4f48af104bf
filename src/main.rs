use clap::{Parser, Subcommand};
use costhost::HostError;
use costhost::error::ConfigError;
use std::path::PathBuf;

mod commands;

use commands::{AccuracyArg, OutputFormat, PriceArgs};

#[derive(Parser)]
#[command(
    name = "costhost",
    about = "Runs pricing plugins and aggregates their estimates into a cost report",
    version,
    author,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Host configuration file (YAML)
    #[arg(short, long, global = true, env = "COSTHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the per-call timeout in milliseconds
    #[arg(long, global = true)]
    call_timeout_ms: Option<u64>,

    /// Enable verbose output (use -vv for debug output)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Price a list of resources
    Price {
        /// Plugin registry file
        #[arg(short, long, env = "COSTHOST_REGISTRY")]
        registry: PathBuf,

        /// Normalized resource list (YAML or JSON)
        #[arg(long)]
        resources: PathBuf,

        /// Live billing credentials: none, all, or a comma-separated provider list
        #[arg(long, default_value = "none")]
        credentials: String,

        #[arg(long, value_enum, default_value = "projected")]
        accuracy: AccuracyArg,

        /// Give up on unfinished resources after this many milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,

        #[arg(long, value_enum, default_value = "summary")]
        format: OutputFormat,
    },

    /// List registered plugins
    Plugins {
        /// Plugin registry file
        #[arg(short, long, env = "COSTHOST_REGISTRY")]
        registry: PathBuf,

        /// Start every plugin and report its negotiation outcome
        #[arg(long)]
        probe: bool,

        #[arg(long, value_enum, default_value = "summary")]
        format: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    init_logging(cli.verbose);

    run(cli).await.map_err(into_report)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = commands::load_host_config(cli.config.as_deref(), cli.call_timeout_ms)?;

    match cli.command {
        Commands::Price {
            registry,
            resources,
            credentials,
            accuracy,
            deadline_ms,
            format,
        } => {
            let args = PriceArgs {
                registry,
                resources,
                credentials,
                accuracy,
                deadline_ms,
                format,
            };
            commands::price_command(config, args).await
        }
        Commands::Plugins {
            registry,
            probe,
            format,
        } => commands::plugins_command(config, &registry, probe, format).await,
    }
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbose {
        0 => EnvFilter::new("costhost=warn"), // Default: warnings and errors only
        1 => EnvFilter::new("costhost=info"), // -v: lifecycle transitions
        _ => EnvFilter::new("costhost=debug"), // -vv or more: per-call detail and plugin stderr
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

/// Configuration errors carry diagnostics; render them through miette
fn into_report(err: anyhow::Error) -> miette::Report {
    let err = match err.downcast::<ConfigError>() {
        Ok(config) => return miette::Report::new(config),
        Err(err) => err,
    };
    match err.downcast::<HostError>() {
        Ok(HostError::Config(config)) => miette::Report::new(config),
        Ok(other) => miette::miette!("{other}"),
        Err(err) => miette::miette!("{err:#}"),
    }
}
