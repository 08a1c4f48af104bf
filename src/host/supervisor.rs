//! Process supervisor
//!
//! Spawns plugin processes, owns their process handles and is the only writer
//! of every instance's lifecycle state. Each plugin gets a Unix socket inside a
//! host-private runtime directory; it is "running" once that socket accepts a
//! connection. Graceful shutdown closes the plugin's stdin, then force-kills
//! after the grace period. Every child is reaped.

use crate::config::HostConfig;
use crate::error::HostError;
use crate::host::InstanceId;
use crate::host::instance::{
    HealthStatus, InstanceRecord, InstanceRegistry, Lifecycle, LifecycleState,
    NegotiatedCapabilities,
};
use crate::plugin::registry::{PluginDescriptor, Tier};
use crate::plugin::sdk::{SOCKET_ARG, SOCKET_ENV};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const READY_POLL: Duration = Duration::from_millis(25);

/// Handles the caller needs right after a successful start
#[derive(Debug)]
pub struct Started {
    pub id: InstanceId,
    pub endpoint: PathBuf,
    /// Health sender for the new instance, to be handed to the health monitor
    pub health: watch::Sender<HealthStatus>,
}

/// Per-plugin view across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub tier: Tier,
    pub restarts: u32,
    pub instance: Option<InstanceId>,
    #[serde(flatten)]
    pub state: LifecycleState,
}

struct Slot {
    descriptor: Arc<PluginDescriptor>,
    lifecycle: watch::Sender<Lifecycle>,
    child: Option<Child>,
    endpoint: PathBuf,
}

struct PluginEntry {
    descriptor: Arc<PluginDescriptor>,
    restarts: u32,
    instance: Option<InstanceId>,
    state: LifecycleState,
}

pub struct Supervisor {
    runtime_dir: TempDir,
    registry: Arc<InstanceRegistry>,
    startup_timeout: Duration,
    shutdown_grace: Duration,
    restart_cap: u32,
    next_id: AtomicU64,
    slots: Mutex<HashMap<InstanceId, Slot>>,
    plugins: Mutex<BTreeMap<String, PluginEntry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Supervisor {
    pub fn new(config: &HostConfig, registry: Arc<InstanceRegistry>) -> Result<Self, HostError> {
        let runtime_dir = tempfile::Builder::new()
            .prefix("costhost-")
            .tempdir()
            .map_err(|err| HostError::LaunchFailure {
                plugin: "*".to_string(),
                reason: format!("could not create runtime directory: {err}"),
            })?;
        debug!("Plugin runtime directory: {}", runtime_dir.path().display());

        Ok(Self {
            runtime_dir,
            registry,
            startup_timeout: config.startup_timeout(),
            shutdown_grace: config.shutdown_grace(),
            restart_cap: config.restart_cap,
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
            plugins: Mutex::new(BTreeMap::new()),
        })
    }

    /// Launch a fresh instance of `descriptor`
    pub async fn start(&self, descriptor: Arc<PluginDescriptor>) -> Result<Started, HostError> {
        let restarts = {
            let mut plugins = lock(&self.plugins);
            plugins
                .entry(descriptor.name.clone())
                .or_insert_with(|| PluginEntry {
                    descriptor: Arc::clone(&descriptor),
                    restarts: 0,
                    instance: None,
                    state: LifecycleState::Starting,
                })
                .restarts
        };
        self.launch(descriptor, restarts).await
    }

    async fn launch(
        &self,
        descriptor: Arc<PluginDescriptor>,
        restart_count: u32,
    ) -> Result<Started, HostError> {
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let endpoint = self
            .runtime_dir
            .path()
            .join(format!("{}-{}.sock", socket_stem(&descriptor.name), id.0));
        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle {
            state: LifecycleState::Starting,
            negotiated: None,
            restart_count,
        });
        self.set_plugin_state(&descriptor.name, Some(id), LifecycleState::Starting);

        info!(
            "Starting plugin {} ({}) as instance {id}",
            descriptor.name,
            descriptor.executable.display()
        );

        let mut command = Command::new(&descriptor.executable);
        command
            .args(&descriptor.args)
            .arg(SOCKET_ARG)
            .arg(&endpoint)
            .env(SOCKET_ENV, &endpoint)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let reason = format!("spawn failed: {err}");
                return Err(self.launch_failed(&descriptor, id, reason));
            }
        };

        if let Some(stderr) = child.stderr.take() {
            forward_stderr(descriptor.name.clone(), id, stderr);
        }

        if let Err(reason) = wait_ready(&mut child, &endpoint, self.startup_timeout).await {
            if let Err(err) = child.kill().await {
                debug!("Instance {id}: kill after failed startup: {err}");
            }
            let _ = std::fs::remove_file(&endpoint);
            return Err(self.launch_failed(&descriptor, id, reason));
        }

        lifecycle_tx.send_modify(|lifecycle| lifecycle.state = LifecycleState::Running);
        let (health_tx, health_rx) = watch::channel(HealthStatus::Healthy);
        self.registry.insert(Arc::new(InstanceRecord::new(
            id,
            Arc::clone(&descriptor),
            lifecycle_rx,
            health_rx,
        )));
        self.set_plugin_state(&descriptor.name, Some(id), LifecycleState::Running);

        info!(
            "Plugin {} instance {id} is running (pid {})",
            descriptor.name,
            child.id().map_or_else(|| "?".to_string(), |pid| pid.to_string())
        );

        lock(&self.slots).insert(
            id,
            Slot {
                descriptor,
                lifecycle: lifecycle_tx,
                child: Some(child),
                endpoint: endpoint.clone(),
            },
        );

        Ok(Started {
            id,
            endpoint,
            health: health_tx,
        })
    }

    fn launch_failed(
        &self,
        descriptor: &PluginDescriptor,
        id: InstanceId,
        reason: String,
    ) -> HostError {
        error!("Plugin {} instance {id} failed to launch: {reason}", descriptor.name);
        self.set_plugin_state(
            &descriptor.name,
            None,
            LifecycleState::Failed {
                reason: reason.clone(),
            },
        );
        HostError::LaunchFailure {
            plugin: descriptor.name.clone(),
            reason,
        }
    }

    /// Gracefully stop an instance. The record stays in the registry as `Stopped`.
    pub async fn stop(&self, id: InstanceId) -> Result<(), HostError> {
        let (child, name) = {
            let mut slots = lock(&self.slots);
            let slot = slots.get_mut(&id).ok_or(HostError::UnknownInstance(id))?;
            (slot.child.take(), slot.descriptor.name.clone())
        };

        if let Some(child) = child {
            terminate(child, &name, id, self.shutdown_grace).await;
        }
        self.finish(id, LifecycleState::Stopped);
        Ok(())
    }

    /// Stop an instance and launch a replacement from the same descriptor.
    ///
    /// The replacement has a new id; the old record leaves the registry. A
    /// replacement that fails to launch uses up a restart and is retried.
    /// Once the plugin has used up its restart cap it is `PermanentlyFailed`
    /// and no replacement is started.
    pub async fn restart(&self, id: InstanceId) -> Result<Started, HostError> {
        let descriptor = lock(&self.slots)
            .get(&id)
            .map(|slot| Arc::clone(&slot.descriptor))
            .ok_or(HostError::UnknownInstance(id))?;

        let mut retiring = Some(id);
        loop {
            let Some(restarts) = self.take_restart(&descriptor.name)? else {
                match retiring {
                    Some(id) => {
                        self.stop(id).await?;
                        self.finish(id, LifecycleState::PermanentlyFailed);
                    }
                    None => self.set_plugin_state(
                        &descriptor.name,
                        None,
                        LifecycleState::PermanentlyFailed,
                    ),
                }
                warn!(
                    "Plugin {} exceeded its restart cap of {}, removing it from routing",
                    descriptor.name, self.restart_cap
                );
                return Err(HostError::RestartCapExceeded {
                    plugin: descriptor.name.clone(),
                    cap: self.restart_cap,
                });
            };

            if let Some(id) = retiring.take() {
                self.stop(id).await?;
                self.forget(id);
            }
            info!(
                "Restarting plugin {} (restart {restarts} of {})",
                descriptor.name, self.restart_cap
            );
            match self.launch(Arc::clone(&descriptor), restarts).await {
                Err(HostError::LaunchFailure { .. }) => continue,
                other => return other,
            }
        }
    }

    /// Count one restart against the cap, `None` once the cap is used up
    fn take_restart(&self, name: &str) -> Result<Option<u32>, HostError> {
        let mut plugins = lock(&self.plugins);
        let entry = plugins
            .get_mut(name)
            .ok_or_else(|| HostError::UnknownPlugin(name.to_string()))?;
        if entry.restarts >= self.restart_cap {
            return Ok(None);
        }
        entry.restarts += 1;
        Ok(Some(entry.restarts))
    }

    /// Publish a successful handshake; the instance becomes routable
    pub fn record_negotiated(
        &self,
        id: InstanceId,
        negotiated: NegotiatedCapabilities,
    ) -> Result<(), HostError> {
        let name = {
            let slots = lock(&self.slots);
            let slot = slots.get(&id).ok_or(HostError::UnknownInstance(id))?;
            let negotiated = Arc::new(negotiated);
            info!(
                "Plugin {} instance {id} negotiated protocol {} (v{})",
                slot.descriptor.name, negotiated.protocol_version, negotiated.plugin_version
            );
            slot.lifecycle.send_modify(|lifecycle| {
                lifecycle.state = LifecycleState::Negotiated;
                lifecycle.negotiated = Some(negotiated);
            });
            slot.descriptor.name.clone()
        };
        self.set_plugin_state(&name, Some(id), LifecycleState::Negotiated);
        Ok(())
    }

    /// Reap an instance that failed negotiation and park it in `state`.
    /// The record stays visible but is never routed to.
    pub async fn reject(&self, id: InstanceId, state: LifecycleState) -> Result<(), HostError> {
        let (child, name) = {
            let mut slots = lock(&self.slots);
            let slot = slots.get_mut(&id).ok_or(HostError::UnknownInstance(id))?;
            (slot.child.take(), slot.descriptor.name.clone())
        };
        warn!("Plugin {name} instance {id} rejected: {state:?}");
        if let Some(child) = child {
            terminate(child, &name, id, self.shutdown_grace).await;
        }
        self.finish(id, state);
        Ok(())
    }

    /// Reset a plugin's restart count and launch it again
    pub async fn revive(&self, name: &str) -> Result<Started, HostError> {
        let (descriptor, previous) = {
            let mut plugins = lock(&self.plugins);
            let entry = plugins
                .get_mut(name)
                .ok_or_else(|| HostError::UnknownPlugin(name.to_string()))?;
            entry.restarts = 0;
            (Arc::clone(&entry.descriptor), entry.instance)
        };

        if let Some(previous) = previous {
            let live = lock(&self.slots)
                .get(&previous)
                .is_some_and(|slot| slot.child.is_some());
            if live {
                self.stop(previous).await?;
            }
            self.forget(previous);
        }

        info!("Reviving plugin {name}");
        self.launch(descriptor, 0).await
    }

    /// Stop every live instance concurrently
    pub async fn shutdown_all(&self) {
        let children: Vec<_> = lock(&self.slots)
            .iter_mut()
            .filter_map(|(id, slot)| {
                slot.child
                    .take()
                    .map(|child| (*id, slot.descriptor.name.clone(), child))
            })
            .collect();

        info!("Stopping {} plugin instance(s)", children.len());
        let grace = self.shutdown_grace;
        let mut stopping = JoinSet::new();
        for (id, name, child) in children {
            stopping.spawn(async move {
                terminate(child, &name, id, grace).await;
                id
            });
        }
        while let Some(joined) = stopping.join_next().await {
            if let Ok(id) = joined {
                self.finish(id, LifecycleState::Stopped);
            }
        }
    }

    pub fn plugin_statuses(&self) -> Vec<PluginStatus> {
        lock(&self.plugins)
            .iter()
            .map(|(name, entry)| PluginStatus {
                name: name.clone(),
                tier: entry.descriptor.tier,
                restarts: entry.restarts,
                instance: entry.instance,
                state: entry.state.clone(),
            })
            .collect()
    }

    fn finish(&self, id: InstanceId, state: LifecycleState) {
        let name = {
            let slots = lock(&self.slots);
            let Some(slot) = slots.get(&id) else {
                return;
            };
            let _ = std::fs::remove_file(&slot.endpoint);
            slot.lifecycle.send_if_modified(|lifecycle| {
                // Incompatible and PermanentlyFailed outlive a later stop
                let keep = matches!(
                    lifecycle.state,
                    LifecycleState::Incompatible { .. } | LifecycleState::PermanentlyFailed
                ) && state == LifecycleState::Stopped;
                if keep || lifecycle.state == state {
                    return false;
                }
                lifecycle.state = state.clone();
                true
            });
            slot.descriptor.name.clone()
        };

        let mut plugins = lock(&self.plugins);
        if let Some(entry) = plugins.get_mut(&name) {
            if entry.instance == Some(id) {
                let keep = matches!(
                    entry.state,
                    LifecycleState::Incompatible { .. } | LifecycleState::PermanentlyFailed
                ) && state == LifecycleState::Stopped;
                if !keep {
                    entry.state = state;
                }
            }
        }
    }

    /// Drop a replaced instance from the registry
    fn forget(&self, id: InstanceId) {
        lock(&self.slots).remove(&id);
        self.registry.remove(id);
    }

    fn set_plugin_state(&self, name: &str, instance: Option<InstanceId>, state: LifecycleState) {
        if let Some(entry) = lock(&self.plugins).get_mut(name) {
            entry.instance = instance;
            entry.state = state;
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // kill_on_drop handles the processes; reap what already exited
        for slot in lock(&self.slots).values_mut() {
            if let Some(child) = slot.child.as_mut() {
                let _ = child.start_kill();
                let _ = child.try_wait();
            }
        }
    }
}

/// Poll until the plugin's socket accepts a connection
async fn wait_ready(child: &mut Child, endpoint: &Path, timeout: Duration) -> Result<(), String> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Err(format!("exited during startup ({status})")),
            Ok(None) => {}
            Err(err) => return Err(format!("could not poll process: {err}")),
        }
        if UnixStream::connect(endpoint).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(format!("endpoint not ready after {timeout:?}"));
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

/// Close stdin, wait out the grace period, then kill. Always reaps.
async fn terminate(mut child: Child, name: &str, id: InstanceId, grace: Duration) {
    drop(child.stdin.take());
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Plugin {name} instance {id} exited ({status})"),
        Ok(Err(err)) => warn!("Plugin {name} instance {id}: wait failed: {err}"),
        Err(_) => {
            warn!("Plugin {name} instance {id} ignored shutdown for {grace:?}, killing");
            if let Err(err) = child.kill().await {
                warn!("Plugin {name} instance {id}: kill failed: {err}");
            }
        }
    }
}

fn forward_stderr(plugin: String, id: InstanceId, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{plugin} {id}] {line}");
        }
    });
}

/// Socket file names keep only characters that are safe in a path component
fn socket_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::capability::CapabilitySet;
    use std::collections::BTreeMap;

    fn config() -> HostConfig {
        HostConfig {
            startup_timeout_ms: 500,
            shutdown_grace_ms: 200,
            ..HostConfig::default()
        }
    }

    fn descriptor(executable: &str, args: &[&str]) -> Arc<PluginDescriptor> {
        Arc::new(PluginDescriptor {
            name: "shell".to_string(),
            source: "test".to_string(),
            executable: PathBuf::from(executable),
            tier: Tier::Fallback,
            capabilities: CapabilitySet::parse(["aws:*"]).unwrap(),
            protocol_version: 1,
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
        })
    }

    #[test]
    fn test_socket_stem_sanitizes_names() {
        assert_eq!(socket_stem("aws-public"), "aws-public");
        assert_eq!(socket_stem("acme/pricing v2"), "acme_pricing_v2");
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_failure() {
        let registry = Arc::new(InstanceRegistry::new());
        let supervisor = Supervisor::new(&config(), Arc::clone(&registry)).unwrap();

        let err = supervisor
            .start(descriptor("/nonexistent/costhost-plugin", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::LaunchFailure { .. }));
        assert!(registry.is_empty());

        let statuses = supervisor.plugin_statuses();
        assert_eq!(statuses.len(), 1);
        assert!(matches!(statuses[0].state, LifecycleState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_early_exit_is_launch_failure() {
        let registry = Arc::new(InstanceRegistry::new());
        let supervisor = Supervisor::new(&config(), Arc::clone(&registry)).unwrap();

        let err = supervisor
            .start(descriptor("/bin/sh", &["-c", "exit 3"]))
            .await
            .unwrap_err();
        match err {
            HostError::LaunchFailure { reason, .. } => {
                assert!(reason.contains("exited") || reason.contains("not ready"), "{reason}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_silent_process_times_out() {
        let registry = Arc::new(InstanceRegistry::new());
        let supervisor = Supervisor::new(&config(), Arc::clone(&registry)).unwrap();

        let started = Instant::now();
        let err = supervisor
            .start(descriptor("/bin/sh", &["-c", "sleep 30"]))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::LaunchFailure { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let supervisor = Supervisor::new(&config(), Arc::new(InstanceRegistry::new())).unwrap();
        assert!(matches!(
            supervisor.stop(InstanceId(42)).await,
            Err(HostError::UnknownInstance(InstanceId(42)))
        ));
        assert!(matches!(
            supervisor.revive("nope").await,
            Err(HostError::UnknownPlugin(_))
        ));
    }
}
