//! Health monitor
//!
//! A background task probes every tracked instance on a fixed interval.
//! Probes run on their own tasks so a slow plugin never delays another
//! plugin's probe or any cost call. The monitor is the only writer of each
//! instance's health status.
//!
//! Transitions:
//! - `Healthy -> Degraded` after one missed probe
//! - `Degraded -> Dead` after `dead_after` consecutive misses
//! - `Degraded -> Healthy` on any successful probe
//!
//! `Dead` is final for an instance. The monitor stops probing it and emits
//! [`HostEvent::InstanceDead`] so the host can restart the plugin.

use crate::config::HostConfig;
use crate::error::TransportError;
use crate::host::InstanceId;
use crate::host::instance::HealthStatus;
use crate::host::transport::Multiplexer;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive misses before an instance is declared dead
    pub dead_after: u32,
}

impl HealthPolicy {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
            dead_after: config.dead_after_missed_probes,
        }
    }
}

/// Events the monitor raises for the host's lifecycle task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    InstanceDead(InstanceId),
}

/// Something that can answer a liveness probe for an instance
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn probe(&self, instance: InstanceId, timeout: Duration) -> Result<(), TransportError>;
}

#[async_trait]
impl Prober for Multiplexer {
    async fn probe(&self, instance: InstanceId, timeout: Duration) -> Result<(), TransportError> {
        self.ping(instance, timeout).await
    }
}

/// Probe bookkeeping for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_misses: u32,
    dead_after: u32,
}

impl HealthTracker {
    pub fn new(dead_after: u32) -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_misses: 0,
            dead_after: dead_after.max(1),
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    /// Returns the new status if the probe changed it
    pub fn record_success(&mut self) -> Option<HealthStatus> {
        if self.status == HealthStatus::Dead {
            return None;
        }
        self.consecutive_misses = 0;
        self.transition(HealthStatus::Healthy)
    }

    /// Returns the new status if the miss changed it
    pub fn record_miss(&mut self) -> Option<HealthStatus> {
        if self.status == HealthStatus::Dead {
            return None;
        }
        self.consecutive_misses += 1;
        let next = if self.consecutive_misses >= self.dead_after {
            HealthStatus::Dead
        } else {
            HealthStatus::Degraded
        };
        self.transition(next)
    }

    fn transition(&mut self, next: HealthStatus) -> Option<HealthStatus> {
        if next == self.status {
            return None;
        }
        self.status = next;
        Some(next)
    }
}

enum Command {
    Track {
        instance: InstanceId,
        health: watch::Sender<HealthStatus>,
    },
    Untrack(InstanceId),
}

struct Tracked {
    health: watch::Sender<HealthStatus>,
    tracker: HealthTracker,
    probing: bool,
}

type ProbeResult = (InstanceId, Result<(), TransportError>);

type Statuses = Arc<RwLock<HashMap<InstanceId, watch::Receiver<HealthStatus>>>>;

pub struct HealthMonitor {
    commands: mpsc::UnboundedSender<Command>,
    statuses: Statuses,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    /// Start the probe loop.
    ///
    /// `failures` carries instances whose channel just dropped; each one is
    /// probed immediately instead of waiting for the next tick.
    pub fn spawn(
        policy: HealthPolicy,
        prober: Arc<dyn Prober>,
        failures: mpsc::UnboundedReceiver<InstanceId>,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(policy, prober, commands_rx, failures, events));
        Self {
            commands,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            task,
        }
    }

    /// Begin probing an instance. The monitor takes over the health sender.
    pub fn track(&self, instance: InstanceId, health: watch::Sender<HealthStatus>) {
        self.statuses
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(instance, health.subscribe());
        let _ = self.commands.send(Command::Track { instance, health });
    }

    pub fn untrack(&self, instance: InstanceId) {
        self.statuses
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&instance);
        let _ = self.commands.send(Command::Untrack(instance));
    }

    /// Last known health of an instance, `None` if it was never tracked
    pub fn status(&self, instance: InstanceId) -> Option<HealthStatus> {
        self.statuses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&instance)
            .map(|rx| *rx.borrow())
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    policy: HealthPolicy,
    prober: Arc<dyn Prober>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut failures: mpsc::UnboundedReceiver<InstanceId>,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    let mut tracked: HashMap<InstanceId, Tracked> = HashMap::new();
    let mut probes: JoinSet<ProbeResult> = JoinSet::new();
    let mut ticker = tokio::time::interval_at(Instant::now() + policy.interval, policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let start_probe =
        |probes: &mut JoinSet<ProbeResult>, instance: InstanceId, entry: &mut Tracked| {
            if entry.probing {
                return;
            }
            entry.probing = true;
            let prober = Arc::clone(&prober);
            let timeout = policy.probe_timeout;
            probes.spawn(async move { (instance, prober.probe(instance, timeout).await) });
        };

    loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                None => break,
                Some(Command::Track { instance, health }) => {
                    debug!("Tracking health of instance {instance}");
                    tracked.insert(instance, Tracked {
                        health,
                        tracker: HealthTracker::new(policy.dead_after),
                        probing: false,
                    });
                }
                Some(Command::Untrack(instance)) => {
                    tracked.remove(&instance);
                }
            },
            Some(instance) = failures.recv() => {
                if let Some(entry) = tracked.get_mut(&instance) {
                    debug!("Channel of instance {instance} failed, probing now");
                    start_probe(&mut probes, instance, entry);
                }
            }
            _ = ticker.tick() => {
                for (instance, entry) in tracked.iter_mut() {
                    start_probe(&mut probes, *instance, entry);
                }
            }
            Some(joined) = probes.join_next(), if !probes.is_empty() => {
                let Ok((instance, result)) = joined else {
                    continue;
                };
                let Some(entry) = tracked.get_mut(&instance) else {
                    continue;
                };
                entry.probing = false;

                let transition = match result {
                    Ok(()) => entry.tracker.record_success(),
                    Err(err) => {
                        debug!(
                            "Instance {instance} missed a probe ({} in a row): {err}",
                            entry.tracker.consecutive_misses() + 1
                        );
                        entry.tracker.record_miss()
                    }
                };

                let Some(status) = transition else {
                    continue;
                };
                entry.health.send_replace(status);
                match status {
                    HealthStatus::Healthy => info!("Instance {instance} recovered"),
                    HealthStatus::Degraded => warn!("Instance {instance} is degraded"),
                    HealthStatus::Dead => {
                        warn!("Instance {instance} is dead");
                        tracked.remove(&instance);
                        let _ = events.send(HostEvent::InstanceDead(instance));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn test_one_miss_degrades() {
        let mut tracker = HealthTracker::new(3);
        assert_eq!(tracker.record_miss(), Some(HealthStatus::Degraded));
        assert_eq!(tracker.record_success(), Some(HealthStatus::Healthy));
        assert_eq!(tracker.record_success(), None);
    }

    #[test]
    fn test_consecutive_misses_kill() {
        let mut tracker = HealthTracker::new(3);
        assert_eq!(tracker.record_miss(), Some(HealthStatus::Degraded));
        assert_eq!(tracker.record_miss(), None);
        assert_eq!(tracker.record_miss(), Some(HealthStatus::Dead));
        assert_eq!(tracker.record_success(), None);
        assert_eq!(tracker.status(), HealthStatus::Dead);
    }

    #[test]
    fn test_success_resets_the_miss_count() {
        let mut tracker = HealthTracker::new(2);
        tracker.record_miss();
        tracker.record_success();
        assert_eq!(tracker.record_miss(), Some(HealthStatus::Degraded));
        assert_eq!(tracker.record_miss(), Some(HealthStatus::Dead));
    }

    #[test]
    fn test_threshold_of_one_goes_straight_to_dead() {
        let mut tracker = HealthTracker::new(1);
        assert_eq!(tracker.record_miss(), Some(HealthStatus::Dead));
    }

    #[derive(Default)]
    struct ScriptedProber {
        down: Mutex<HashSet<InstanceId>>,
    }

    impl ScriptedProber {
        fn set_down(&self, instance: InstanceId, down: bool) {
            let mut set = self.down.lock().unwrap();
            if down {
                set.insert(instance);
            } else {
                set.remove(&instance);
            }
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(
            &self,
            instance: InstanceId,
            timeout: Duration,
        ) -> Result<(), TransportError> {
            if self.down.lock().unwrap().contains(&instance) {
                Err(TransportError::Timeout(timeout))
            } else {
                Ok(())
            }
        }
    }

    fn policy() -> HealthPolicy {
        HealthPolicy {
            interval: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(10),
            dead_after: 3,
        }
    }

    #[tokio::test]
    async fn test_unresponsive_instance_dies_and_raises_event() {
        let prober = Arc::new(ScriptedProber::default());
        prober.set_down(InstanceId(1), true);
        let (_failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::spawn(policy(), prober.clone(), failures_rx, events_tx);

        let (health_tx, mut health_rx) = watch::channel(HealthStatus::Healthy);
        monitor.track(InstanceId(1), health_tx);
        let (healthy_tx, _healthy_rx) = watch::channel(HealthStatus::Healthy);
        monitor.track(InstanceId(2), healthy_tx);

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, HostEvent::InstanceDead(InstanceId(1)));
        assert_eq!(*health_rx.borrow_and_update(), HealthStatus::Dead);
        assert_eq!(monitor.status(InstanceId(1)), Some(HealthStatus::Dead));
        assert_eq!(monitor.status(InstanceId(2)), Some(HealthStatus::Healthy));
        assert_eq!(monitor.status(InstanceId(3)), None);
    }

    #[tokio::test]
    async fn test_recovery_after_degraded() {
        let prober = Arc::new(ScriptedProber::default());
        prober.set_down(InstanceId(1), true);
        let (_failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::spawn(
            HealthPolicy {
                dead_after: 1000,
                ..policy()
            },
            prober.clone(),
            failures_rx,
            events_tx,
        );

        let (health_tx, mut health_rx) = watch::channel(HealthStatus::Healthy);
        monitor.track(InstanceId(1), health_tx);

        let wait = health_rx.wait_for(|s| *s == HealthStatus::Degraded);
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .unwrap()
            .unwrap();
        prober.set_down(InstanceId(1), false);
        let wait = health_rx.wait_for(|s| *s == HealthStatus::Healthy);
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_channel_failure_triggers_immediate_probe() {
        let prober = Arc::new(ScriptedProber::default());
        prober.set_down(InstanceId(7), true);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::spawn(
            HealthPolicy {
                interval: Duration::from_secs(3600),
                ..policy()
            },
            prober.clone(),
            failures_rx,
            events_tx,
        );

        let (health_tx, mut health_rx) = watch::channel(HealthStatus::Healthy);
        monitor.track(InstanceId(7), health_tx);
        failures_tx.send(InstanceId(7)).unwrap();

        let wait = health_rx.wait_for(|s| *s == HealthStatus::Degraded);
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .unwrap()
            .unwrap();
    }
}
