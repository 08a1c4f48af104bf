//! Routing and aggregation
//!
//! Every resource is matched against an ordered chain of selection rules,
//! priced on the instance the first matching rule picks, and recorded in its
//! own report slot. Calls run concurrently; a failing or slow resource never
//! holds back or discards another resource's result.

use crate::cost::{
    Confidence, CostReport, CostRequest, CostResult, Estimate, PricingContext, ReportBuilder,
    ServedBy, UnpricedReason,
};
use crate::error::{HostError, TransportError};
use crate::host::InstanceId;
use crate::host::instance::{Candidate, HealthStatus};
use crate::host::transport::Multiplexer;
use crate::plugin::protocol::{PriceRequest, PriceResponse, price_response::Outcome};
use crate::plugin::registry::Tier;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Sends one pricing call to one instance
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn price(
        &self,
        instance: InstanceId,
        request: PriceRequest,
    ) -> Result<PriceResponse, TransportError>;
}

#[async_trait]
impl Dispatcher for Multiplexer {
    async fn price(
        &self,
        instance: InstanceId,
        request: PriceRequest,
    ) -> Result<PriceResponse, TransportError> {
        Multiplexer::price(self, instance, request).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TierChoice {
    Preferred,
    Opposite,
}

/// One step of the selection chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRule {
    pub name: &'static str,
    tier: TierChoice,
    health: HealthStatus,
    confidence: Confidence,
}

impl SelectionRule {
    fn accepts(&self, candidate: &Candidate, resource_type: &str, preferred: Tier) -> bool {
        let tier = match self.tier {
            TierChoice::Preferred => preferred,
            TierChoice::Opposite => preferred.opposite(),
        };
        candidate.tier == tier && candidate.health == self.health && candidate.covers(resource_type)
    }
}

/// Evaluated top-down; the first rule with a match wins
pub const SELECTION_CHAIN: [SelectionRule; 4] = [
    SelectionRule {
        name: "preferred-healthy",
        tier: TierChoice::Preferred,
        health: HealthStatus::Healthy,
        confidence: Confidence::Standard,
    },
    SelectionRule {
        name: "preferred-degraded",
        tier: TierChoice::Preferred,
        health: HealthStatus::Degraded,
        confidence: Confidence::Standard,
    },
    SelectionRule {
        name: "substitute-healthy",
        tier: TierChoice::Opposite,
        health: HealthStatus::Healthy,
        confidence: Confidence::Substitute,
    },
    SelectionRule {
        name: "substitute-degraded",
        tier: TierChoice::Opposite,
        health: HealthStatus::Degraded,
        confidence: Confidence::Substitute,
    },
];

/// Pick the instance for one resource. Ties within a rule go to the lowest
/// (plugin name, instance id), so a fixed snapshot always selects the same
/// instance.
pub fn select<'a>(
    candidates: &'a [Candidate],
    resource_type: &str,
    preferred: Tier,
    excluded: &HashSet<InstanceId>,
) -> Option<(&'a Candidate, Confidence)> {
    SELECTION_CHAIN.iter().find_map(|rule| {
        candidates
            .iter()
            .filter(|c| !excluded.contains(&c.id) && rule.accepts(c, resource_type, preferred))
            .min_by(|a, b| (a.plugin.as_str(), a.id).cmp(&(b.plugin.as_str(), b.id)))
            .map(|c| (c, rule.confidence))
    })
}

type SlotOutcome = (usize, CostResult, Option<ServedBy>);

pub struct Router {
    dispatcher: Arc<dyn Dispatcher>,
}

impl Router {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Price every resource in `request` against a snapshot of routable
    /// instances. Only an invalid request is an error; everything else ends
    /// up in the report.
    pub async fn price(
        &self,
        candidates: Vec<Candidate>,
        request: &CostRequest,
        context: &PricingContext,
    ) -> Result<CostReport, HostError> {
        request.validate().map_err(HostError::InvalidRequest)?;

        let deadline = request.deadline().map(|d| Instant::now() + d);
        let candidates: Arc<[Candidate]> = candidates.into();
        let mut builder = ReportBuilder::new(request);
        let mut tasks: JoinSet<SlotOutcome> = JoinSet::new();
        let mut groups: BTreeMap<InstanceId, usize> = BTreeMap::new();

        for (index, resource) in request.resources().iter().enumerate() {
            let resource_type = resource.resource.resource_type.clone();
            let preferred = context.preferred_tier(resource);

            let Some((first, _)) = select(&candidates, &resource_type, preferred, &HashSet::new())
            else {
                debug!(
                    "No capable plugin for {} ({resource_type})",
                    resource.resource.id
                );
                builder.record(index, CostResult::Unpriced(UnpricedReason::NoCapablePlugin), None);
                continue;
            };
            *groups.entry(first.id).or_default() += 1;

            let call = Call {
                dispatcher: Arc::clone(&self.dispatcher),
                candidates: Arc::clone(&candidates),
                resource_type,
                preferred,
                wire: context.to_wire(resource),
            };
            tasks.spawn(async move {
                let (result, served_by) = call.resolve().await;
                (index, result, served_by)
            });
        }

        for (instance, count) in &groups {
            debug!("Dispatching {count} resource(s) to instance {instance}");
        }

        let mut deadline_hit = false;
        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            "Deadline exceeded with {} resource(s) outstanding",
                            builder.pending()
                        );
                        tasks.abort_all();
                        deadline_hit = true;
                        break;
                    }
                },
                None => tasks.join_next().await,
            };
            let Some(joined) = next else {
                break;
            };

            match joined {
                Ok((index, result, served_by)) => {
                    builder.record(index, result, served_by);
                }
                Err(err) => warn!("Pricing task failed: {err}"),
            }
        }

        let missing = if deadline_hit {
            UnpricedReason::DeadlineExceeded
        } else {
            UnpricedReason::InvalidResponse {
                detail: "pricing task failed".to_string(),
            }
        };
        Ok(builder.finish(missing))
    }
}

/// Everything one resource's task needs, owned so the task is `'static`
struct Call {
    dispatcher: Arc<dyn Dispatcher>,
    candidates: Arc<[Candidate]>,
    resource_type: String,
    preferred: Tier,
    wire: PriceRequest,
}

impl Call {
    /// Walk the selection chain, moving on to the next eligible instance
    /// whenever a call times out or loses its channel
    async fn resolve(self) -> (CostResult, Option<ServedBy>) {
        let mut tried = HashSet::new();
        let mut last_failure = None;

        while let Some((candidate, confidence)) =
            select(&self.candidates, &self.resource_type, self.preferred, &tried)
        {
            tried.insert(candidate.id);
            let served_by = ServedBy {
                plugin: candidate.plugin.clone(),
                instance: candidate.id,
                tier: candidate.tier,
            };

            match self.dispatcher.price(candidate.id, self.wire.clone()).await {
                Ok(response) => {
                    let result = interpret(response, candidate.tier, confidence);
                    return (result, Some(served_by));
                }
                Err(err) if is_retryable(&err) => {
                    warn!(
                        "Instance {} failed to price {}: {err}",
                        candidate.id, self.resource_type
                    );
                    last_failure = Some((unpriced_reason(err), served_by));
                }
                Err(err) => {
                    let reason = UnpricedReason::InvalidResponse {
                        detail: err.to_string(),
                    };
                    return (CostResult::Unpriced(reason), Some(served_by));
                }
            }
        }

        match last_failure {
            Some((reason, served_by)) => (CostResult::Unpriced(reason), Some(served_by)),
            None => (CostResult::Unpriced(UnpricedReason::NoCapablePlugin), None),
        }
    }
}

fn is_retryable(err: &TransportError) -> bool {
    err.is_transient() || matches!(err, TransportError::UnknownInstance(_))
}

fn unpriced_reason(err: TransportError) -> UnpricedReason {
    match err {
        TransportError::Timeout(_) => UnpricedReason::Timeout,
        TransportError::Protocol(detail) => UnpricedReason::InvalidResponse { detail },
        other => UnpricedReason::ChannelFailure {
            detail: other.to_string(),
        },
    }
}

/// Turn a plugin's answer into a report result
fn interpret(response: PriceResponse, tier: Tier, confidence: Confidence) -> CostResult {
    match response.outcome {
        Some(Outcome::Estimate(estimate)) => {
            if !estimate.amount.is_finite() || estimate.amount < 0.0 {
                return CostResult::Unpriced(UnpricedReason::InvalidResponse {
                    detail: format!("amount {} is not a valid cost", estimate.amount),
                });
            }
            if estimate.currency.is_empty() {
                return CostResult::Unpriced(UnpricedReason::InvalidResponse {
                    detail: "estimate has no currency".to_string(),
                });
            }
            CostResult::Priced(Estimate {
                amount: estimate.amount,
                currency: estimate.currency,
                unit_price: estimate.unit_price,
                billing_detail: estimate.billing_detail,
                source_tier: tier,
                confidence,
            })
        }
        Some(Outcome::Error(err)) => CostResult::Unpriced(UnpricedReason::PluginError {
            code: err.code,
            message: err.message,
        }),
        None => CostResult::Unpriced(UnpricedReason::InvalidResponse {
            detail: "response carries neither an estimate nor an error".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::{Accuracy, Credentials, ResourceDescriptor};
    use crate::host::instance::NegotiatedCapabilities;
    use crate::plugin::capability::{CapabilitySet, EffectiveCapabilities};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone)]
    enum Behavior {
        Price(f64),
        Delay(Duration, f64),
        Fail(TransportError),
        Reject(&'static str),
    }

    #[derive(Default)]
    struct FakeDispatcher {
        behaviors: HashMap<InstanceId, Behavior>,
        calls: Mutex<Vec<(InstanceId, String)>>,
    }

    impl FakeDispatcher {
        fn with(mut self, id: u64, behavior: Behavior) -> Self {
            self.behaviors.insert(InstanceId(id), behavior);
            self
        }

        fn calls(&self) -> Vec<(InstanceId, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatcher for FakeDispatcher {
        async fn price(
            &self,
            instance: InstanceId,
            request: PriceRequest,
        ) -> Result<PriceResponse, TransportError> {
            let id = request.resource.map(|r| r.id).unwrap_or_default();
            self.calls.lock().unwrap().push((instance, id));
            match self.behaviors.get(&instance).cloned() {
                Some(Behavior::Price(amount)) => Ok(PriceResponse::estimate(amount, "USD")),
                Some(Behavior::Delay(delay, amount)) => {
                    tokio::time::sleep(delay).await;
                    Ok(PriceResponse::estimate(amount, "USD"))
                }
                Some(Behavior::Fail(err)) => Err(err),
                Some(Behavior::Reject(code)) => Ok(PriceResponse::error(code, "rejected")),
                None => Err(TransportError::UnknownInstance(instance)),
            }
        }
    }

    fn candidate(
        id: u64,
        plugin: &str,
        tier: Tier,
        health: HealthStatus,
        caps: &[&str],
    ) -> Candidate {
        let set = CapabilitySet::parse(caps).unwrap();
        Candidate {
            id: InstanceId(id),
            plugin: plugin.to_string(),
            tier,
            health,
            capabilities: Arc::new(NegotiatedCapabilities {
                plugin_version: "1.0.0".to_string(),
                protocol_version: 1,
                capabilities: EffectiveCapabilities::intersect(set.clone(), set),
            }),
        }
    }

    fn ec2(id: &str) -> ResourceDescriptor {
        ResourceDescriptor::new("aws:ec2/instance:Instance", id).with_region("us-east-1")
    }

    fn router(dispatcher: FakeDispatcher) -> (Router, Arc<FakeDispatcher>) {
        let dispatcher = Arc::new(dispatcher);
        (Router::new(dispatcher.clone()), dispatcher)
    }

    #[test]
    fn test_selection_prefers_healthy_then_degraded_then_substitute() {
        let none = HashSet::new();
        let degraded = candidate(1, "pub", Tier::Fallback, HealthStatus::Degraded, &["aws:*"]);
        let live = candidate(2, "live", Tier::Production, HealthStatus::Healthy, &["aws:*"]);
        let healthy = candidate(3, "pub", Tier::Fallback, HealthStatus::Healthy, &["aws:*"]);
        let rt = "aws:ec2/instance:Instance";

        let all = vec![degraded.clone(), live.clone(), healthy.clone()];
        let (chosen, confidence) = select(&all, rt, Tier::Fallback, &none).unwrap();
        assert_eq!((chosen.id, confidence), (InstanceId(3), Confidence::Standard));

        let no_healthy = vec![degraded.clone(), live.clone()];
        let (chosen, confidence) = select(&no_healthy, rt, Tier::Fallback, &none).unwrap();
        assert_eq!((chosen.id, confidence), (InstanceId(1), Confidence::Standard));

        let only_live = vec![live];
        let (chosen, confidence) = select(&only_live, rt, Tier::Fallback, &none).unwrap();
        assert_eq!((chosen.id, confidence), (InstanceId(2), Confidence::Substitute));

        assert!(select(&only_live, "gcp:storage/bucket:Bucket", Tier::Fallback, &none).is_none());
    }

    #[test]
    fn test_selection_ties_break_on_name_then_id() {
        let none = HashSet::new();
        let all = vec![
            candidate(9, "beta", Tier::Fallback, HealthStatus::Healthy, &["aws:*"]),
            candidate(5, "alpha", Tier::Fallback, HealthStatus::Healthy, &["aws:*"]),
            candidate(4, "alpha", Tier::Fallback, HealthStatus::Healthy, &["aws:*"]),
        ];
        for _ in 0..10 {
            let (chosen, _) = select(&all, "aws:s3/bucket:Bucket", Tier::Fallback, &none).unwrap();
            assert_eq!(chosen.id, InstanceId(4));
        }

        let excluded = HashSet::from([InstanceId(4)]);
        let (chosen, _) = select(&all, "aws:s3/bucket:Bucket", Tier::Fallback, &excluded).unwrap();
        assert_eq!(chosen.id, InstanceId(5));
    }

    #[tokio::test]
    async fn test_three_resources_priced_by_fallback() {
        let (router, dispatcher) = router(FakeDispatcher::default().with(1, Behavior::Price(10.0)));
        let candidates =
            vec![candidate(1, "aws-public", Tier::Fallback, HealthStatus::Healthy, &["aws:*"])];
        let request = CostRequest::new([ec2("a"), ec2("b"), ec2("c")]);

        let report = router
            .price(candidates, &request, &PricingContext::default())
            .await
            .unwrap();

        assert_eq!(report.len(), 3);
        assert_eq!(report.priced().count(), 3);
        for entry in report.entries() {
            let estimate = entry.result.estimate().unwrap();
            assert_eq!(estimate.source_tier, Tier::Fallback);
            assert_eq!(estimate.confidence, Confidence::Standard);
            assert_eq!(entry.served_by.as_ref().unwrap().instance, InstanceId(1));
        }
        assert_eq!(report.totals().get("USD"), Some(&30.0));
        assert_eq!(dispatcher.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_live_credentials_without_production_plugin_substitute() {
        let (router, _) = router(FakeDispatcher::default().with(1, Behavior::Price(4.0)));
        let candidates =
            vec![candidate(1, "aws-public", Tier::Fallback, HealthStatus::Healthy, &["aws:*"])];
        let request = CostRequest::new([ec2("a")]);
        let context = PricingContext::new(Credentials::All, Accuracy::Actual);

        let report = router.price(candidates, &request, &context).await.unwrap();
        let estimate = report.entry("a").unwrap().result.estimate().unwrap();
        assert_eq!(estimate.source_tier, Tier::Fallback);
        assert_eq!(estimate.confidence, Confidence::Substitute);
    }

    #[tokio::test]
    async fn test_no_capable_plugin_and_plugin_errors_are_reported() {
        let dispatcher = FakeDispatcher::default().with(1, Behavior::Reject("unknown_sku"));
        let (router, _) = router(dispatcher);
        let candidates =
            vec![candidate(1, "aws-public", Tier::Fallback, HealthStatus::Healthy, &["aws:*"])];
        let request = CostRequest::new([
            ec2("a"),
            ResourceDescriptor::new("gcp:storage/bucket:Bucket", "b"),
        ]);

        let report = router
            .price(candidates, &request, &PricingContext::default())
            .await
            .unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(
            report.entry("a").unwrap().result.unpriced_reason(),
            Some(&UnpricedReason::PluginError {
                code: "unknown_sku".to_string(),
                message: "rejected".to_string()
            })
        );
        assert_eq!(
            report.entry("b").unwrap().result.unpriced_reason(),
            Some(&UnpricedReason::NoCapablePlugin)
        );
        assert!(report.entry("b").unwrap().served_by.is_none());
    }

    #[tokio::test]
    async fn test_timeout_retries_on_next_instance() {
        let (router, dispatcher) = router(
            FakeDispatcher::default()
                .with(1, Behavior::Fail(TransportError::Timeout(Duration::from_millis(5))))
                .with(2, Behavior::Price(7.0)),
        );
        let candidates = vec![
            candidate(1, "a-public", Tier::Fallback, HealthStatus::Healthy, &["aws:*"]),
            candidate(2, "b-public", Tier::Fallback, HealthStatus::Healthy, &["aws:*"]),
        ];
        let report = router
            .price(candidates, &CostRequest::new([ec2("x")]), &PricingContext::default())
            .await
            .unwrap();

        let entry = report.entry("x").unwrap();
        assert_eq!(entry.result.estimate().unwrap().amount, 7.0);
        assert_eq!(entry.served_by.as_ref().unwrap().instance, InstanceId(2));
        assert_eq!(dispatcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_last_transient_failure_becomes_the_reason() {
        let (router, _) = router(FakeDispatcher::default().with(
            1,
            Behavior::Fail(TransportError::ChannelFailure("reset".to_string())),
        ));
        let candidates =
            vec![candidate(1, "aws-public", Tier::Fallback, HealthStatus::Healthy, &["aws:*"])];
        let report = router
            .price(candidates, &CostRequest::new([ec2("x")]), &PricingContext::default())
            .await
            .unwrap();
        assert!(matches!(
            report.entry("x").unwrap().result.unpriced_reason(),
            Some(UnpricedReason::ChannelFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_resource_does_not_delay_others_within_deadline() {
        let (router, _) = router(
            FakeDispatcher::default()
                .with(1, Behavior::Delay(Duration::from_secs(5), 1.0))
                .with(2, Behavior::Price(2.0)),
        );
        let candidates = vec![
            candidate(1, "slow", Tier::Fallback, HealthStatus::Healthy, &["aws:ec2/*"]),
            candidate(2, "fast", Tier::Fallback, HealthStatus::Healthy, &["aws:s3/*"]),
        ];
        let request = CostRequest::new([
            ec2("slow-one"),
            ResourceDescriptor::new("aws:s3/bucket:Bucket", "fast-one"),
        ])
        .with_deadline(Duration::from_secs(1));

        let started = Instant::now();
        let report = router
            .price(candidates, &request, &PricingContext::default())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(
            report.entry("slow-one").unwrap().result.unpriced_reason(),
            Some(&UnpricedReason::DeadlineExceeded)
        );
        assert_eq!(report.entry("fast-one").unwrap().result.estimate().unwrap().amount, 2.0);
    }

    #[tokio::test]
    async fn test_invalid_request_is_fatal() {
        let (router, _) = router(FakeDispatcher::default());
        let request = CostRequest::new([ec2("dup"), ec2("dup")]);
        let err = router
            .price(vec![], &request, &PricingContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::InvalidRequest(_)));
    }

    #[test]
    fn test_invalid_estimates_are_rejected() {
        let response = PriceResponse::estimate(f64::NAN, "USD");
        assert!(matches!(
            interpret(response, Tier::Fallback, Confidence::Standard),
            CostResult::Unpriced(UnpricedReason::InvalidResponse { .. })
        ));
        let response = PriceResponse::estimate(1.0, "");
        assert!(!interpret(response, Tier::Fallback, Confidence::Standard).is_priced());
        let empty = PriceResponse::default();
        assert!(!interpret(empty, Tier::Fallback, Confidence::Standard).is_priced());
    }
}
