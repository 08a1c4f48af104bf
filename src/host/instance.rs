//! Instance records and the shared instance registry
//!
//! Each running plugin process has one [`InstanceRecord`]. Its lifecycle and
//! health are published through `watch` channels: the supervisor holds the only
//! lifecycle sender and the health monitor holds the only health sender, so each
//! field has exactly one writer while any number of readers take snapshots.

use crate::plugin::capability::EffectiveCapabilities;
use crate::plugin::registry::{PluginDescriptor, Tier};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Starting,
    /// Process is up and its endpoint accepts connections
    Running,
    /// Passed the handshake; eligible for routing
    Negotiated,
    /// Launch error or startup timeout
    Failed { reason: String },
    /// Version or capability mismatch; never scheduled, never restarted
    Incompatible { reason: String },
    /// Replaced by a restart or shut down
    Stopped,
    /// Exceeded the restart cap; waits for manual intervention
    PermanentlyFailed,
}

/// Outcome of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiatedCapabilities {
    pub plugin_version: String,
    pub protocol_version: u32,
    pub capabilities: EffectiveCapabilities,
}

/// Lifecycle fields of an instance, written by the supervisor only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    pub state: LifecycleState,
    pub negotiated: Option<Arc<NegotiatedCapabilities>>,
    /// Restarts of this plugin that preceded this instance
    pub restart_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Dead,
}

/// Shared view of one plugin instance
#[derive(Debug)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub descriptor: Arc<PluginDescriptor>,
    lifecycle: watch::Receiver<Lifecycle>,
    health: watch::Receiver<HealthStatus>,
}

impl InstanceRecord {
    pub(crate) fn new(
        id: InstanceId,
        descriptor: Arc<PluginDescriptor>,
        lifecycle: watch::Receiver<Lifecycle>,
        health: watch::Receiver<HealthStatus>,
    ) -> Self {
        Self {
            id,
            descriptor,
            lifecycle,
            health,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.borrow().clone()
    }

    pub fn health(&self) -> HealthStatus {
        *self.health.borrow()
    }

    /// Routing view of this instance, if it may receive traffic at all
    pub fn candidate(&self) -> Option<Candidate> {
        let lifecycle = self.lifecycle.borrow();
        if lifecycle.state != LifecycleState::Negotiated {
            return None;
        }
        let negotiated = lifecycle.negotiated.clone()?;
        let health = self.health();
        if health == HealthStatus::Dead {
            return None;
        }

        Some(Candidate {
            id: self.id,
            plugin: self.descriptor.name.clone(),
            tier: self.descriptor.tier,
            health,
            capabilities: negotiated,
        })
    }
}

/// Immutable snapshot of a routable instance
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: InstanceId,
    pub plugin: String,
    pub tier: Tier,
    pub health: HealthStatus,
    pub capabilities: Arc<NegotiatedCapabilities>,
}

impl Candidate {
    pub fn covers(&self, resource_type: &str) -> bool {
        self.capabilities.capabilities.covers(resource_type)
    }
}

/// Descriptor → instance mapping shared by every component.
///
/// The map lock only guards membership; it is held for inserts, removals and
/// snapshot copies, never across an await.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<BTreeMap<InstanceId, Arc<InstanceRecord>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, record: Arc<InstanceRecord>) {
        self.instances
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(record.id, record);
    }

    pub(crate) fn remove(&self, id: InstanceId) -> Option<Arc<InstanceRecord>> {
        self.instances
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id)
    }

    pub fn get(&self, id: InstanceId) -> Option<Arc<InstanceRecord>> {
        self.instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn records(&self) -> Vec<Arc<InstanceRecord>> {
        self.instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Routable instances, ordered by (plugin name, instance id)
    pub fn snapshot(&self) -> Vec<Candidate> {
        let mut candidates: Vec<_> = self
            .records()
            .iter()
            .filter_map(|record| record.candidate())
            .collect();
        candidates.sort_by(|a, b| a.plugin.cmp(&b.plugin).then(a.id.cmp(&b.id)));
        candidates
    }

    pub fn len(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
