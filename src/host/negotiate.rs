//! Startup handshake: protocol version and capability negotiation

use crate::config::ProtocolRange;
use crate::error::{NegotiationError, TransportError};
use crate::host::InstanceId;
use crate::host::instance::NegotiatedCapabilities;
use crate::host::transport::Multiplexer;
use crate::plugin::capability::{CapabilitySet, EffectiveCapabilities};
use crate::plugin::protocol::{NegotiateRequest, NegotiateResponse};
use crate::plugin::registry::PluginDescriptor;
use std::time::Duration;
use tracing::{debug, warn};

/// Pause before the single retry after a transient transport failure
const RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct Negotiator {
    supported: ProtocolRange,
    timeout: Duration,
}

impl Negotiator {
    pub fn new(supported: ProtocolRange, timeout: Duration) -> Self {
        Self { supported, timeout }
    }

    /// Run the handshake against a freshly started instance
    pub async fn negotiate(
        &self,
        mux: &Multiplexer,
        instance: InstanceId,
        descriptor: &PluginDescriptor,
    ) -> Result<NegotiatedCapabilities, NegotiationError> {
        let response = match self.exchange(mux, instance).await {
            Err(err) if err.is_transient() => {
                debug!(
                    "Negotiation with {} {instance} hit a transient failure ({err}), retrying once",
                    descriptor.name
                );
                tokio::time::sleep(RETRY_DELAY).await;
                self.exchange(mux, instance).await
            }
            other => other,
        }
        .map_err(NegotiationError::Transport)?;

        self.evaluate(descriptor, response)
    }

    async fn exchange(
        &self,
        mux: &Multiplexer,
        instance: InstanceId,
    ) -> Result<NegotiateResponse, TransportError> {
        let request = NegotiateRequest {
            host_min_protocol: self.supported.min,
            host_max_protocol: self.supported.max,
            host_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        mux.negotiate(instance, request, self.timeout).await
    }

    /// Apply the compatibility rules to a plugin's handshake response
    pub fn evaluate(
        &self,
        descriptor: &PluginDescriptor,
        response: NegotiateResponse,
    ) -> Result<NegotiatedCapabilities, NegotiationError> {
        // Both the registry declaration and the handshake must be in range
        for version in [descriptor.protocol_version, response.protocol_version] {
            if !self.supported.contains(version) {
                return Err(NegotiationError::Incompatible {
                    plugin: version,
                    min: self.supported.min,
                    max: self.supported.max,
                });
            }
        }

        if response.protocol_version != descriptor.protocol_version {
            warn!(
                "Plugin {} declared protocol {} but negotiated {}",
                descriptor.name, descriptor.protocol_version, response.protocol_version
            );
        }

        if !response.plugin_name.is_empty() && response.plugin_name != descriptor.name {
            debug!(
                "Plugin {} identifies itself as '{}'",
                descriptor.name, response.plugin_name
            );
        }

        let advertised = CapabilitySet::parse(&response.capabilities)
            .map_err(|err| NegotiationError::InvalidCapability(err.to_string()))?;
        let capabilities =
            EffectiveCapabilities::intersect(descriptor.capabilities.clone(), advertised);
        if capabilities.is_disjoint() {
            return Err(NegotiationError::NoSharedCapabilities);
        }

        Ok(NegotiatedCapabilities {
            plugin_version: response.plugin_version,
            protocol_version: response.protocol_version,
            capabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::registry::Tier;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn descriptor(capabilities: &[&str]) -> PluginDescriptor {
        PluginDescriptor {
            name: "aws-public".to_string(),
            source: "test".to_string(),
            executable: PathBuf::from("/bin/true"),
            tier: Tier::Fallback,
            capabilities: CapabilitySet::parse(capabilities).unwrap(),
            protocol_version: 1,
            args: vec![],
            env: BTreeMap::new(),
        }
    }

    fn response(protocol_version: u32, capabilities: &[&str]) -> NegotiateResponse {
        NegotiateResponse {
            plugin_name: "aws-public".to_string(),
            plugin_version: "0.3.0".to_string(),
            protocol_version,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn negotiator() -> Negotiator {
        Negotiator::new(ProtocolRange { min: 1, max: 2 }, Duration::from_secs(1))
    }

    #[test]
    fn test_version_inside_range_is_accepted() {
        let negotiated = negotiator()
            .evaluate(&descriptor(&["aws:*"]), response(2, &["aws:*"]))
            .unwrap();
        assert_eq!(negotiated.protocol_version, 2);
        assert_eq!(negotiated.plugin_version, "0.3.0");
    }

    #[test]
    fn test_version_outside_range_is_incompatible() {
        for version in [0, 3, 99] {
            let err = negotiator()
                .evaluate(&descriptor(&["aws:*"]), response(version, &["aws:*"]))
                .unwrap_err();
            assert!(err.is_incompatible(), "version {version}: {err:?}");
        }
    }

    #[test]
    fn test_declared_version_outside_range_is_incompatible() {
        let mut declared_future = descriptor(&["aws:*"]);
        declared_future.protocol_version = 9;

        let err = negotiator()
            .evaluate(&declared_future, response(1, &["aws:*"]))
            .unwrap_err();
        assert_eq!(
            err,
            NegotiationError::Incompatible {
                plugin: 9,
                min: 1,
                max: 2
            }
        );
    }

    #[test]
    fn test_over_claimed_capabilities_are_intersected() {
        let negotiated = negotiator()
            .evaluate(
                &descriptor(&["aws:ec2/*"]),
                response(1, &["aws:*", "gcp:*"]),
            )
            .unwrap();
        assert!(negotiated.capabilities.covers("aws:ec2/instance:Instance"));
        assert!(!negotiated.capabilities.covers("aws:s3/bucket:Bucket"));
        assert!(!negotiated.capabilities.covers("gcp:compute/instance:Instance"));
    }

    #[test]
    fn test_disjoint_capabilities_are_incompatible() {
        let err = negotiator()
            .evaluate(&descriptor(&["aws:*"]), response(1, &["azure:*"]))
            .unwrap_err();
        assert_eq!(err, NegotiationError::NoSharedCapabilities);
        assert!(err.is_incompatible());
    }

    #[test]
    fn test_invalid_advertised_pattern() {
        let err = negotiator()
            .evaluate(&descriptor(&["aws:*"]), response(1, &[""]))
            .unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidCapability(_)));
    }

    #[tokio::test]
    async fn test_unreachable_plugin_fails_after_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (failures_tx, _failures_rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::new(Duration::from_secs(1), failures_tx);
        mux.open(InstanceId(1), &dir.path().join("missing.sock"));

        let err = negotiator()
            .negotiate(&mux, InstanceId(1), &descriptor(&["aws:*"]))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Transport(TransportError::Connect(_))));
        assert!(!err.is_incompatible());
    }
}
