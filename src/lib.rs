pub mod config;
pub mod cost;
pub mod error;
pub mod host;
pub mod plugin;

pub use config::HostConfig;
pub use cost::{
    Accuracy, CostReport, CostRequest, CostResult, Credentials, PricingContext, ResourceDescriptor,
    ResourceRequest, UnpricedReason,
};
pub use error::HostError;
pub use host::{InstanceId, PluginHost};
