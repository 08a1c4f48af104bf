//! Configurable pricing plugin for integration tests
//!
//! Behaviour is driven entirely by environment variables:
//!
//! | Variable               | Meaning                                              |
//! |------------------------|------------------------------------------------------|
//! | `STUB_NAME`            | plugin name reported in the handshake                |
//! | `STUB_PROTOCOL`        | protocol version reported in the handshake (1)       |
//! | `STUB_CAPABILITIES`    | comma-separated advertised patterns (`aws:*`)        |
//! | `STUB_PRICE`           | amount returned for every resource (10.0)            |
//! | `STUB_CURRENCY`        | currency of every estimate (`USD`)                   |
//! | `STUB_DELAYS`          | `id=ms,...` per-resource response delays             |
//! | `STUB_FAIL_IDS`        | comma-separated ids answered with a `PriceError`     |
//! | `STUB_CRASH_IDS`       | comma-separated ids that make the process exit       |
//! | `STUB_HANG_PINGS`      | when `1`, liveness probes are never answered         |
//! | `STUB_HANG_ONCE_MARKER`| first instance to see this path missing creates it   |
//! |                        | and hangs its probes; later instances behave         |

use anyhow::{Context, Result};
use async_trait::async_trait;
use costhost::plugin::protocol::{PriceRequest, PriceResponse};
use costhost::plugin::sdk::{self, PluginInfo, PricingPlugin};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

struct StubPlugin {
    info: PluginInfo,
    price: f64,
    currency: String,
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
    crashing: HashSet<String>,
    hang_pings: bool,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn id_list(name: &str) -> HashSet<String> {
    var(name)
        .unwrap_or_default()
        .split(',')
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

impl StubPlugin {
    fn from_env() -> Result<Self> {
        let name = var("STUB_NAME").unwrap_or_else(|| "stub".to_string());
        let protocol = var("STUB_PROTOCOL")
            .map(|v| v.parse::<u32>())
            .transpose()
            .context("STUB_PROTOCOL must be an integer")?
            .unwrap_or(1);
        let capabilities: Vec<String> = var("STUB_CAPABILITIES")
            .unwrap_or_else(|| "aws:*".to_string())
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let price = var("STUB_PRICE")
            .map(|v| v.parse::<f64>())
            .transpose()
            .context("STUB_PRICE must be a number")?
            .unwrap_or(10.0);

        let mut delays = HashMap::new();
        for pair in var("STUB_DELAYS").unwrap_or_default().split(',') {
            let Some((id, ms)) = pair.split_once('=') else {
                continue;
            };
            let ms: u64 = ms
                .trim()
                .parse()
                .with_context(|| format!("Bad delay for '{id}'"))?;
            delays.insert(id.trim().to_string(), Duration::from_millis(ms));
        }

        let failing = id_list("STUB_FAIL_IDS");
        let crashing = id_list("STUB_CRASH_IDS");

        let mut hang_pings = var("STUB_HANG_PINGS").as_deref() == Some("1");
        if let Some(marker) = var("STUB_HANG_ONCE_MARKER").map(PathBuf::from) {
            if !marker.exists() {
                std::fs::write(&marker, std::process::id().to_string())
                    .with_context(|| format!("Failed to create {}", marker.display()))?;
                hang_pings = true;
            }
        }

        Ok(Self {
            info: PluginInfo::new(&name, env!("CARGO_PKG_VERSION"), protocol, capabilities),
            price,
            currency: var("STUB_CURRENCY").unwrap_or_else(|| "USD".to_string()),
            delays,
            failing,
            crashing,
            hang_pings,
        })
    }
}

#[async_trait]
impl PricingPlugin for StubPlugin {
    fn info(&self) -> PluginInfo {
        self.info.clone()
    }

    async fn price(&self, request: PriceRequest) -> PriceResponse {
        let id = request
            .resource
            .as_ref()
            .map(|r| r.id.clone())
            .unwrap_or_default();

        if let Some(delay) = self.delays.get(&id) {
            tokio::time::sleep(*delay).await;
        }
        if self.crashing.contains(&id) {
            tracing::warn!("Crashing on {id} as configured");
            std::process::exit(70);
        }
        if self.failing.contains(&id) {
            return PriceResponse::error("stub_failure", format!("configured to fail {id}"));
        }

        let mut response = PriceResponse::estimate(self.price, self.currency.clone());
        if let Some(costhost::plugin::protocol::price_response::Outcome::Estimate(estimate)) =
            response.outcome.as_mut()
        {
            estimate.unit_price = self.price;
            estimate.billing_detail = format!("{} flat rate", self.info.name);
        }
        response
    }

    async fn ping(&self) {
        if self.hang_pings {
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info"))
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let plugin = StubPlugin::from_env()?;
    sdk::serve(plugin).await
}
