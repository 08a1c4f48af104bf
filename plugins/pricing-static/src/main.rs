use anyhow::Result;
use async_trait::async_trait;
use costhost::plugin::protocol::{PriceRequest, PriceResponse, price_response::Outcome};
use costhost::plugin::sdk::{self, PluginInfo, PricingPlugin};

mod table;

use table::PriceTable;

const PLUGIN_NAME: &str = "pricing-static";
const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");
const PROTOCOL_VERSION: u32 = 2;

struct StaticPricing {
    table: PriceTable,
}

#[async_trait]
impl PricingPlugin for StaticPricing {
    fn info(&self) -> PluginInfo {
        PluginInfo::new(
            PLUGIN_NAME,
            PLUGIN_VERSION,
            PROTOCOL_VERSION,
            self.table.resource_types(),
        )
    }

    async fn price(&self, request: PriceRequest) -> PriceResponse {
        let Some(resource) = request.resource else {
            return PriceResponse::error("invalid_request", "request carries no resource");
        };

        match self.table.quote(&resource.resource_type, &resource.tags) {
            Ok(quote) => {
                tracing::debug!("Priced {} at {:.4}", resource.id, quote.amount);
                let mut response =
                    PriceResponse::estimate(quote.amount, self.table.currency.clone());
                if let Some(Outcome::Estimate(estimate)) = response.outcome.as_mut() {
                    estimate.unit_price = quote.unit_price;
                    estimate.billing_detail = quote.detail;
                }
                response
            }
            Err(miss) => PriceResponse::error(miss.code, miss.message),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("costhost_pricing_static=info".parse()?),
        )
        .with_target(false)
        .without_time()
        .init();

    tracing::info!("Starting {PLUGIN_NAME} v{PLUGIN_VERSION}");

    let table = PriceTable::embedded()?;
    sdk::serve(StaticPricing { table }).await
}
