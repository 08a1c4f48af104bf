//! The plugin host
//!
//! [`PluginHost`] wires the supervisor, negotiator, health monitor, transport
//! multiplexer and router together. Bringing a plugin up is always the same
//! sequence: start the process, open its channel, negotiate, publish the
//! negotiated capabilities, begin probing. A background lifecycle task reacts
//! to dead instances by running that sequence again on a replacement.

pub mod health;
pub mod instance;
pub mod negotiate;
pub mod router;
pub mod supervisor;
pub mod transport;

pub use health::{HealthMonitor, HealthPolicy, HostEvent};
pub use instance::{
    Candidate, HealthStatus, InstanceId, InstanceRecord, InstanceRegistry, LifecycleState,
};
pub use negotiate::Negotiator;
pub use router::{Dispatcher, Router};
pub use supervisor::{PluginStatus, Started, Supervisor};
pub use transport::{Multiplexer, RpcChannel};

use crate::config::HostConfig;
use crate::cost::{CostReport, CostRequest, PricingContext};
use crate::error::HostError;
use crate::plugin::registry::{PluginDescriptor, PluginRegistry, Tier};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// Point-in-time view of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub plugin: String,
    pub tier: Tier,
    #[serde(flatten)]
    pub state: LifecycleState,
    pub health: HealthStatus,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
}

impl InstanceStatus {
    fn of(record: &InstanceRecord) -> Self {
        let lifecycle = record.lifecycle();
        Self {
            id: record.id,
            plugin: record.descriptor.name.clone(),
            tier: record.descriptor.tier,
            state: lifecycle.state,
            health: record.health(),
            restart_count: lifecycle.restart_count,
            protocol_version: lifecycle.negotiated.map(|n| n.protocol_version),
        }
    }
}

struct Inner {
    registry: Arc<InstanceRegistry>,
    supervisor: Supervisor,
    mux: Arc<Multiplexer>,
    negotiator: Negotiator,
    monitor: HealthMonitor,
    router: Router,
    shut_down: AtomicBool,
}

pub struct PluginHost {
    inner: Arc<Inner>,
    lifecycle: JoinHandle<()>,
}

impl PluginHost {
    /// Start every registered plugin and return once each one is either
    /// negotiated or has failed. Plugin failures are logged and visible in
    /// [`PluginHost::plugin_statuses`]; only an invalid configuration fails.
    pub async fn start(config: HostConfig, plugins: &PluginRegistry) -> Result<Self, HostError> {
        config.validate()?;

        let registry = Arc::new(InstanceRegistry::new());
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mux = Arc::new(Multiplexer::new(config.call_timeout(), failures_tx));
        let monitor = HealthMonitor::spawn(
            HealthPolicy::from_config(&config),
            mux.clone(),
            failures_rx,
            events_tx,
        );

        let inner = Arc::new(Inner {
            supervisor: Supervisor::new(&config, Arc::clone(&registry))?,
            registry,
            negotiator: Negotiator::new(config.protocol, config.call_timeout()),
            router: Router::new(mux.clone()),
            mux,
            monitor,
            shut_down: AtomicBool::new(false),
        });

        let mut starting = JoinSet::new();
        for descriptor in plugins.plugins() {
            let inner = Arc::clone(&inner);
            let descriptor = Arc::clone(descriptor);
            starting.spawn(async move { inner.bring_up(descriptor).await });
        }
        while let Some(joined) = starting.join_next().await {
            match joined {
                Ok(Ok(id)) => info!("Instance {id} is ready"),
                Ok(Err(err)) => warn!("{err}"),
                Err(err) => error!("Plugin startup task failed: {err}"),
            }
        }

        let lifecycle = tokio::spawn(lifecycle_loop(Arc::clone(&inner), events_rx));
        info!(
            "Plugin host ready: {} of {} plugin(s) routable",
            inner.registry.snapshot().len(),
            plugins.len()
        );

        Ok(Self { inner, lifecycle })
    }

    /// Price a batch of resources. Instance failures only ever degrade the
    /// report; invalid requests and a shut-down host are errors.
    pub async fn price(
        &self,
        request: &CostRequest,
        context: &PricingContext,
    ) -> Result<CostReport, HostError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(HostError::ShutDown);
        }
        let candidates = self.inner.registry.snapshot();
        self.inner.router.price(candidates, request, context).await
    }

    pub fn status(&self, id: InstanceId) -> Result<InstanceStatus, HostError> {
        self.inner
            .registry
            .get(id)
            .map(|record| InstanceStatus::of(&record))
            .ok_or(HostError::UnknownInstance(id))
    }

    /// Health as last published by the monitor
    pub fn health(&self, id: InstanceId) -> Option<HealthStatus> {
        self.inner.monitor.status(id)
    }

    pub fn instances(&self) -> Vec<InstanceStatus> {
        self.inner
            .registry
            .records()
            .iter()
            .map(|record| InstanceStatus::of(record))
            .collect()
    }

    pub fn plugin_statuses(&self) -> Vec<PluginStatus> {
        self.inner.supervisor.plugin_statuses()
    }

    /// Bring a permanently failed (or otherwise stopped) plugin back with a
    /// fresh restart budget
    pub async fn revive(&self, name: &str) -> Result<InstanceId, HostError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(HostError::ShutDown);
        }
        let previous = self
            .inner
            .supervisor
            .plugin_statuses()
            .into_iter()
            .find(|status| status.name == name)
            .and_then(|status| status.instance);
        if let Some(previous) = previous {
            self.inner.monitor.untrack(previous);
            self.inner.mux.close(previous).await;
        }

        let started = self.inner.supervisor.revive(name).await?;
        let descriptor = self.inner.descriptor_of(started.id)?;
        self.inner.activate(descriptor, started).await
    }

    /// Stop probing, close every channel and stop every plugin process
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down plugin host");
        self.lifecycle.abort();
        self.inner.monitor.shutdown();
        for record in self.inner.registry.records() {
            self.inner.mux.close(record.id).await;
        }
        self.inner.supervisor.shutdown_all().await;
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.lifecycle.abort();
    }
}

impl Inner {
    async fn bring_up(&self, descriptor: Arc<PluginDescriptor>) -> Result<InstanceId, HostError> {
        let started = self.supervisor.start(Arc::clone(&descriptor)).await?;
        self.activate(descriptor, started).await
    }

    /// Negotiate with a started instance and make it routable
    async fn activate(
        &self,
        descriptor: Arc<PluginDescriptor>,
        started: Started,
    ) -> Result<InstanceId, HostError> {
        let id = started.id;
        self.mux.open(id, &started.endpoint);

        match self.negotiator.negotiate(&self.mux, id, &descriptor).await {
            Ok(negotiated) => {
                self.supervisor.record_negotiated(id, negotiated)?;
                self.monitor.track(id, started.health);
                Ok(id)
            }
            Err(err) => {
                self.mux.close(id).await;
                let reason = err.to_string();
                let state = if err.is_incompatible() {
                    LifecycleState::Incompatible { reason }
                } else {
                    LifecycleState::Failed { reason }
                };
                self.supervisor.reject(id, state).await?;
                Err(HostError::Negotiation {
                    plugin: descriptor.name.clone(),
                    source: err,
                })
            }
        }
    }

    fn descriptor_of(&self, id: InstanceId) -> Result<Arc<PluginDescriptor>, HostError> {
        self.registry
            .get(id)
            .map(|record| Arc::clone(&record.descriptor))
            .ok_or(HostError::UnknownInstance(id))
    }

    /// Replace a dead instance, subject to the restart cap
    async fn replace(&self, id: InstanceId) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        self.mux.close(id).await;

        let descriptor = match self.descriptor_of(id) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!("Cannot replace instance {id}: {err}");
                return;
            }
        };

        self.monitor.untrack(id);

        // A replacement that fails negotiation for a transient reason is
        // retired in turn; the supervisor's restart cap bounds the loop
        let mut retiring = id;
        loop {
            if self.shut_down.load(Ordering::Acquire) {
                return;
            }
            let started = match self.supervisor.restart(retiring).await {
                Ok(started) => started,
                Err(HostError::RestartCapExceeded { plugin, cap }) => {
                    error!("Plugin {plugin} is permanently failed after {cap} restart(s)");
                    return;
                }
                Err(err) => {
                    warn!("Restart of instance {retiring} failed: {err}");
                    return;
                }
            };

            let replacement = started.id;
            match self.activate(Arc::clone(&descriptor), started).await {
                Ok(new_id) => {
                    info!("Instance {id} replaced by {new_id}");
                    return;
                }
                Err(HostError::Negotiation { source, .. }) if source.is_incompatible() => {
                    warn!("Replacement {replacement} for instance {id} is incompatible: {source}");
                    return;
                }
                Err(err) => {
                    warn!("Replacement {replacement} for instance {id} is not routable: {err}");
                    retiring = replacement;
                }
            }
        }
    }
}

async fn lifecycle_loop(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<HostEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            HostEvent::InstanceDead(id) => inner.replace(id).await,
        }
    }
}
