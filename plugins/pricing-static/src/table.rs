//! Embedded list-price table

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

const PRICES_YAML: &str = include_str!("prices.yaml");

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Rate {
    /// Hourly rate per SKU; the SKU comes from a resource tag
    Hourly {
        sku_tag: String,
        hourly: BTreeMap<String, f64>,
    },
    Monthly { monthly: f64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceTable {
    pub currency: String,
    pub hours_per_month: f64,
    pub resources: BTreeMap<String, Rate>,
}

/// A priced resource
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub amount: f64,
    pub unit_price: f64,
    pub detail: String,
}

/// Why the table cannot price a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Miss {
    pub code: &'static str,
    pub message: String,
}

impl PriceTable {
    pub fn embedded() -> Result<Self> {
        serde_yaml::from_str(PRICES_YAML).context("Embedded price table is malformed")
    }

    /// Resource types this table can price
    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn quote(
        &self,
        resource_type: &str,
        tags: &HashMap<String, String>,
    ) -> Result<Quote, Miss> {
        let rate = self.resources.get(resource_type).ok_or_else(|| Miss {
            code: "unsupported_resource",
            message: format!("no list price for {resource_type}"),
        })?;

        match rate {
            Rate::Monthly { monthly } => Ok(Quote {
                amount: *monthly,
                unit_price: *monthly,
                detail: "flat monthly list price".to_string(),
            }),
            Rate::Hourly { sku_tag, hourly } => {
                let sku = tags.get(sku_tag).ok_or_else(|| Miss {
                    code: "missing_sku",
                    message: format!("tag '{sku_tag}' is required to price {resource_type}"),
                })?;
                let rate = hourly.get(sku).ok_or_else(|| Miss {
                    code: "unknown_sku",
                    message: format!("no list price for {sku_tag}={sku}"),
                })?;
                Ok(Quote {
                    amount: rate * self.hours_per_month,
                    unit_price: *rate,
                    detail: format!("{sku} at {rate}/h x {}h", self.hours_per_month),
                })
            }
        }
    }
}
