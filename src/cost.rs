//! Cost requests, per-resource results, and the aggregated report

use crate::host::InstanceId;
use crate::plugin::capability::provider_of;
use crate::plugin::protocol;
use crate::plugin::registry::Tier;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

/// One resource from a normalized deployment plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ResourceDescriptor {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            region: String::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn provider(&self) -> &str {
        provider_of(&self.resource_type)
    }
}

/// How fresh the pricing data has to be
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accuracy {
    /// Projected cost from list prices
    #[default]
    Projected,
    /// Historical/actual spend from a billing API
    Actual,
}

/// Inclusive-exclusive window for actual-cost queries, seconds since the epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_unix: i64,
    pub end_unix: i64,
}

/// One resource to price, with its per-resource overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(flatten)]
    pub resource: ResourceDescriptor,
    /// Overrides the request-wide accuracy for this resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<Accuracy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<TimeWindow>,
}

impl From<ResourceDescriptor> for ResourceRequest {
    fn from(resource: ResourceDescriptor) -> Self {
        Self {
            resource,
            accuracy: None,
            window: None,
        }
    }
}

/// A batch of resources to price. Immutable once handed to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CostRequest {
    resources: Vec<ResourceRequest>,
    deadline: Option<Duration>,
}

impl CostRequest {
    pub fn new<I, R>(resources: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ResourceRequest>,
    {
        Self {
            resources: resources.into_iter().map(Into::into).collect(),
            deadline: None,
        }
    }

    /// Bound the whole request; unfinished resources report `DeadlineExceeded`
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn resources(&self) -> &[ResourceRequest] {
        &self.resources
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Reject requests that could not produce one entry per resource
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for request in &self.resources {
            let resource = &request.resource;
            if resource.id.is_empty() {
                return Err(format!(
                    "resource of type '{}' has an empty id",
                    resource.resource_type
                ));
            }
            if resource.resource_type.is_empty() {
                return Err(format!("resource '{}' has an empty type", resource.id));
            }
            if !seen.insert(resource.id.as_str()) {
                return Err(format!("resource '{}' appears more than once", resource.id));
            }
            if matches!(request.window, Some(w) if w.end_unix <= w.start_unix) {
                return Err(format!(
                    "resource '{}' has an empty time window",
                    resource.id
                ));
            }
        }
        Ok(())
    }
}

/// Which providers the caller holds live billing credentials for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Credentials {
    #[default]
    None,
    All,
    Providers(BTreeSet<String>),
}

impl Credentials {
    pub fn covers(&self, provider: &str) -> bool {
        match self {
            Credentials::None => false,
            Credentials::All => true,
            Credentials::Providers(providers) => providers.contains(provider),
        }
    }
}

/// Caller context for one `price` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PricingContext {
    pub credentials: Credentials,
    pub accuracy: Accuracy,
}

impl PricingContext {
    pub fn new(credentials: Credentials, accuracy: Accuracy) -> Self {
        Self {
            credentials,
            accuracy,
        }
    }

    pub fn accuracy_for(&self, request: &ResourceRequest) -> Accuracy {
        request.accuracy.unwrap_or(self.accuracy)
    }

    /// The tier this resource should be served from. Decided per resource, so
    /// a request may mix live and list-price resources.
    pub fn preferred_tier(&self, request: &ResourceRequest) -> Tier {
        let live = self.credentials.covers(request.resource.provider())
            && self.accuracy_for(request) == Accuracy::Actual;
        if live { Tier::Production } else { Tier::Fallback }
    }

    pub(crate) fn to_wire(&self, request: &ResourceRequest) -> protocol::PriceRequest {
        let resource = &request.resource;
        let accuracy = match self.accuracy_for(request) {
            Accuracy::Projected => protocol::WireAccuracy::Projected,
            Accuracy::Actual => protocol::WireAccuracy::Actual,
        };
        protocol::PriceRequest {
            resource: Some(protocol::Resource {
                resource_type: resource.resource_type.clone(),
                id: resource.id.clone(),
                region: resource.region.clone(),
                tags: resource
                    .tags
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }),
            accuracy: accuracy as i32,
            window: request.window.map(|w| protocol::TimeWindow {
                start_unix: w.start_unix,
                end_unix: w.end_unix,
            }),
            credentials_present: self.credentials.covers(resource.provider()),
        }
    }
}

/// Whether an estimate came from the tier the resource asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Standard,
    /// Served by the opposite tier as a best-effort substitute
    Substitute,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub amount: f64,
    pub currency: String,
    pub unit_price: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub billing_detail: String,
    pub source_tier: Tier,
    pub confidence: Confidence,
}

/// Why a resource has no price
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnpricedReason {
    NoCapablePlugin,
    Timeout,
    ChannelFailure { detail: String },
    DeadlineExceeded,
    PluginError { code: String, message: String },
    InvalidResponse { detail: String },
}

impl fmt::Display for UnpricedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnpricedReason::NoCapablePlugin => f.write_str("no capable plugin"),
            UnpricedReason::Timeout => f.write_str("plugin call timed out"),
            UnpricedReason::ChannelFailure { detail } => write!(f, "channel failure: {detail}"),
            UnpricedReason::DeadlineExceeded => f.write_str("request deadline exceeded"),
            UnpricedReason::PluginError { code, message } => {
                write!(f, "plugin error [{code}]: {message}")
            }
            UnpricedReason::InvalidResponse { detail } => write!(f, "invalid response: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CostResult {
    Priced(Estimate),
    Unpriced(UnpricedReason),
}

impl CostResult {
    pub fn is_priced(&self) -> bool {
        matches!(self, CostResult::Priced(_))
    }

    pub fn estimate(&self) -> Option<&Estimate> {
        match self {
            CostResult::Priced(estimate) => Some(estimate),
            CostResult::Unpriced(_) => None,
        }
    }

    pub fn unpriced_reason(&self) -> Option<&UnpricedReason> {
        match self {
            CostResult::Priced(_) => None,
            CostResult::Unpriced(reason) => Some(reason),
        }
    }
}

/// Manifest line: which plugin instance answered for a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServedBy {
    pub plugin: String,
    pub instance: InstanceId,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub resource: ResourceDescriptor,
    pub result: CostResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub served_by: Option<ServedBy>,
}

/// The aggregated outcome of one `price` call. Entries follow request order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostReport {
    entries: Vec<ReportEntry>,
    totals: BTreeMap<String, f64>,
}

impl CostReport {
    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, resource_id: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.resource.id == resource_id)
    }

    /// Sum of priced amounts per currency
    pub fn totals(&self) -> &BTreeMap<String, f64> {
        &self.totals
    }

    pub fn priced(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.result.is_priced())
    }

    pub fn unpriced(&self) -> impl Iterator<Item = (&ReportEntry, &UnpricedReason)> {
        self.entries
            .iter()
            .filter_map(|e| e.result.unpriced_reason().map(|reason| (e, reason)))
    }
}

/// Collects results slot by slot. Every requested resource owns exactly one
/// slot; `finish` fills any slot still empty with the supplied reason.
#[derive(Debug)]
pub struct ReportBuilder {
    resources: Vec<ResourceDescriptor>,
    slots: Vec<Option<(CostResult, Option<ServedBy>)>>,
}

impl ReportBuilder {
    pub fn new(request: &CostRequest) -> Self {
        let resources: Vec<_> = request
            .resources()
            .iter()
            .map(|r| r.resource.clone())
            .collect();
        let slots = vec![None; resources.len()];
        Self { resources, slots }
    }

    /// Record the outcome for the resource at `index`. A second record for the
    /// same slot is ignored and reported as `false`.
    pub fn record(
        &mut self,
        index: usize,
        result: CostResult,
        served_by: Option<ServedBy>,
    ) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some((result, served_by));
                true
            }
            _ => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    pub fn finish(self, missing: UnpricedReason) -> CostReport {
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        let entries = self
            .resources
            .into_iter()
            .zip(self.slots)
            .map(|(resource, slot)| {
                let (result, served_by) =
                    slot.unwrap_or_else(|| (CostResult::Unpriced(missing.clone()), None));
                if let CostResult::Priced(estimate) = &result {
                    *totals.entry(estimate.currency.clone()).or_default() += estimate.amount;
                }
                ReportEntry {
                    resource,
                    result,
                    served_by,
                }
            })
            .collect();

        CostReport { entries, totals }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimate(amount: f64) -> CostResult {
        CostResult::Priced(Estimate {
            amount,
            currency: "USD".to_string(),
            unit_price: 0.0,
            billing_detail: String::new(),
            source_tier: Tier::Fallback,
            confidence: Confidence::Standard,
        })
    }

    fn request(ids: &[&str]) -> CostRequest {
        CostRequest::new(
            ids.iter()
                .map(|id| ResourceDescriptor::new("aws:ec2/instance:Instance", *id)),
        )
    }

    #[test]
    fn test_duplicate_resource_ids_are_invalid() {
        let err = request(&["web", "db", "web"]).validate().unwrap_err();
        assert!(err.contains("web"));
    }

    #[test]
    fn test_empty_window_is_invalid() {
        let mut req: ResourceRequest =
            ResourceDescriptor::new("aws:s3/bucket:Bucket", "logs").into();
        req.window = Some(TimeWindow {
            start_unix: 100,
            end_unix: 100,
        });
        assert!(CostRequest::new([req]).validate().is_err());
    }

    #[test]
    fn test_preferred_tier_needs_credentials_and_actual_data() {
        let aws: ResourceRequest = ResourceDescriptor::new("aws:ec2/instance:Instance", "a").into();
        let gcp: ResourceRequest =
            ResourceDescriptor::new("gcp:compute/instance:Instance", "g").into();

        let projected = PricingContext::new(Credentials::All, Accuracy::Projected);
        assert_eq!(projected.preferred_tier(&aws), Tier::Fallback);

        let no_creds = PricingContext::new(Credentials::None, Accuracy::Actual);
        assert_eq!(no_creds.preferred_tier(&aws), Tier::Fallback);

        let partial = PricingContext::new(
            Credentials::Providers(BTreeSet::from(["aws".to_string()])),
            Accuracy::Actual,
        );
        assert_eq!(partial.preferred_tier(&aws), Tier::Production);
        assert_eq!(partial.preferred_tier(&gcp), Tier::Fallback);
    }

    #[test]
    fn test_per_resource_accuracy_overrides_context() {
        let mut req: ResourceRequest =
            ResourceDescriptor::new("aws:ec2/instance:Instance", "a").into();
        req.accuracy = Some(Accuracy::Actual);
        let context = PricingContext::new(Credentials::All, Accuracy::Projected);
        assert_eq!(context.preferred_tier(&req), Tier::Production);

        let wire = context.to_wire(&req);
        assert_eq!(wire.accuracy(), protocol::WireAccuracy::Actual);
        assert!(wire.credentials_present);
    }

    #[test]
    fn test_builder_fills_missing_slots_and_keeps_order() {
        let req = request(&["a", "b", "c"]);
        let mut builder = ReportBuilder::new(&req);
        assert!(builder.record(2, estimate(5.0), None));
        assert!(builder.record(0, estimate(1.5), None));
        assert_eq!(builder.pending(), 1);

        let report = builder.finish(UnpricedReason::DeadlineExceeded);
        let ids: Vec<_> = report.entries().iter().map(|e| e.resource.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(
            report.entry("b").unwrap().result,
            CostResult::Unpriced(UnpricedReason::DeadlineExceeded)
        );
        assert_eq!(report.totals().get("USD"), Some(&6.5));
    }

    #[test]
    fn test_builder_ignores_second_result_for_a_slot() {
        let req = request(&["a"]);
        let mut builder = ReportBuilder::new(&req);
        assert!(builder.record(0, estimate(1.0), None));
        assert!(!builder.record(0, estimate(99.0), None));
        assert!(!builder.record(7, estimate(1.0), None));

        let report = builder.finish(UnpricedReason::NoCapablePlugin);
        assert_eq!(report.len(), 1);
        assert_eq!(report.totals().get("USD"), Some(&1.0));
    }

    #[test]
    fn test_report_serializes_reason_tags() {
        let req = request(&["a"]);
        let report = ReportBuilder::new(&req).finish(UnpricedReason::NoCapablePlugin);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["entries"][0]["result"]["status"], "unpriced");
        assert_eq!(json["entries"][0]["result"]["reason"], "no_capable_plugin");
        assert_eq!(json["entries"][0]["resource"]["type"], "aws:ec2/instance:Instance");
    }

    #[test]
    fn test_resource_request_reads_flat_yaml() {
        let yaml = r#"
- type: aws:ec2/instance:Instance
  id: web
  region: us-east-1
  tags: { instanceType: t3.micro }
- type: aws:s3/bucket:Bucket
  id: logs
  accuracy: actual
"#;
        let parsed: Vec<ResourceRequest> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].resource.region, "us-east-1");
        assert_eq!(parsed[1].accuracy, Some(Accuracy::Actual));
    }
}
