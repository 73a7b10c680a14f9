//! Primary/standby health monitoring.
//!
//! Each tick probes every instance, folds the result into a per-instance
//! debounce counter and re-derives the group's [`HaState`]. Entering
//! `FAILOVER_ACTIVE` moves traffic to the standby and fires a state sync;
//! moving traffic back is an operator decision ([`HealthWatchdog::failback`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::collaborators::{HealthProbe, StateSync};
use crate::error::{Error, Result};
use crate::events::{EventBroadcaster, EventKind};
use crate::infrastructure::SharedStateStore;
use crate::types::*;

pub const DEFAULT_TICK: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 2;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub tick: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures before an instance is UNHEALTHY
    pub failure_threshold: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

struct MonitoredGroup {
    endpoints: ServiceGroup,
    health: GroupHealth,
}

/// HA transition observed during one tick
struct Transition {
    group: String,
    from: HaState,
    to: HaState,
    serving: Role,
}

pub struct HealthWatchdog {
    groups: Mutex<Vec<MonitoredGroup>>,
    probe: Arc<dyn HealthProbe>,
    sync: Arc<dyn StateSync>,
    store: SharedStateStore,
    events: EventBroadcaster,
    config: WatchdogConfig,
    ticking: AtomicBool,
}

impl HealthWatchdog {
    pub fn new(
        groups: Vec<ServiceGroup>,
        probe: Arc<dyn HealthProbe>,
        sync: Arc<dyn StateSync>,
        store: SharedStateStore,
        events: EventBroadcaster,
        config: WatchdogConfig,
    ) -> Self {
        let groups = groups
            .into_iter()
            .map(|g| MonitoredGroup {
                health: GroupHealth {
                    group: g.name.clone(),
                    primary: ServiceHealth::new(g.primary.service_id.clone(), Role::Primary),
                    standby: ServiceHealth::new(g.standby.service_id.clone(), Role::Standby),
                    ha_state: HaState::Active,
                    serving: Role::Primary,
                },
                endpoints: g,
            })
            .collect();

        Self {
            groups: Mutex::new(groups),
            probe,
            sync,
            store,
            events,
            config,
            ticking: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Tick forever on `config.tick` until `cancel` fires. Late ticks are
    /// skipped, never bunched up.
    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(poll_period(self.config.tick));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                tick_secs = self.config.tick.as_secs(),
                threshold = self.config.failure_threshold,
                "health watchdog started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("health watchdog stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Probe every group once. Returns `None` if a tick is already running.
    pub async fn tick(&self) -> Option<Vec<GroupHealth>> {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("previous watchdog tick still running, skipping");
            return None;
        }
        let _running = TickFlag(&self.ticking);

        let targets: Vec<ServiceGroup> = self
            .groups
            .lock()
            .iter()
            .map(|g| g.endpoints.clone())
            .collect();

        let results = join_all(targets.iter().map(|g| async move {
            futures::join!(self.probe_one(&g.primary), self.probe_one(&g.standby))
        }))
        .await;

        let now = now_ms();
        let threshold = self.config.failure_threshold;
        let mut transitions = Vec::new();
        let mut snapshots = Vec::new();

        let report = {
            let mut groups = self.groups.lock();
            for (group, (primary_ok, standby_ok)) in groups.iter_mut().zip(results) {
                let health = &mut group.health;
                Self::fold(&mut health.primary, primary_ok, threshold, now);
                Self::fold(&mut health.standby, standby_ok, threshold, now);

                let previous = health.ha_state;
                let derived = HaState::derive(health.primary.status, health.standby.status);
                if derived != previous {
                    if derived == HaState::FailoverActive {
                        health.serving = Role::Standby;
                    }
                    health.ha_state = derived;
                    transitions.push(Transition {
                        group: health.group.clone(),
                        from: previous,
                        to: derived,
                        serving: health.serving,
                    });
                }
                snapshots.push(health.primary.clone());
                snapshots.push(health.standby.clone());
            }
            groups.iter().map(|g| g.health.clone()).collect::<Vec<_>>()
        };

        self.persist(&snapshots);
        for transition in transitions {
            self.announce(transition);
        }

        Some(report)
    }

    /// Operator action: send traffic back to the primary after a failover.
    pub fn failback(&self, group: &str) -> Result<GroupHealth> {
        let mut groups = self.groups.lock();
        let monitored = groups
            .iter_mut()
            .find(|g| g.health.group == group)
            .ok_or_else(|| Error::UnknownGroup(group.to_string()))?;

        let health = &mut monitored.health;
        if health.primary.status != HealthStatus::Healthy {
            return Err(Error::PrimaryUnhealthy(group.to_string()));
        }
        let was = health.serving;
        health.serving = Role::Primary;
        let snapshot = health.clone();
        drop(groups);

        if was != Role::Primary {
            tracing::info!(group, ha_state = %snapshot.ha_state, "operator failback to primary");
            self.events.publish(
                EventKind::HaStateChanged,
                json!({
                    "group": group,
                    "from": snapshot.ha_state,
                    "to": snapshot.ha_state,
                    "serving": snapshot.serving,
                    "action": "failback",
                }),
            );
        }
        Ok(snapshot)
    }

    pub fn groups(&self) -> Vec<GroupHealth> {
        self.groups.lock().iter().map(|g| g.health.clone()).collect()
    }

    pub fn group(&self, name: &str) -> Option<GroupHealth> {
        self.groups
            .lock()
            .iter()
            .find(|g| g.health.group == name)
            .map(|g| g.health.clone())
    }

    pub fn ha_state(&self, name: &str) -> Option<HaState> {
        self.group(name).map(|g| g.ha_state)
    }

    async fn probe_one(&self, endpoint: &Endpoint) -> bool {
        match tokio::time::timeout(self.config.probe_timeout, self.probe.probe(endpoint)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(service = %endpoint.service_id, error = %e, "probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(
                    service = %endpoint.service_id,
                    timeout_ms = self.config.probe_timeout.as_millis() as u64,
                    "probe timed out"
                );
                false
            }
        }
    }

    fn fold(health: &mut ServiceHealth, ok: bool, threshold: u32, now: Timestamp) {
        let flipped = health.record_probe(ok, threshold, now);
        match (flipped, health.status) {
            (true, HealthStatus::Unhealthy) => tracing::warn!(
                service = %health.service_id,
                role = %health.role,
                failures = health.consecutive_failures,
                "instance marked UNHEALTHY"
            ),
            (true, HealthStatus::Healthy) => tracing::info!(
                service = %health.service_id,
                role = %health.role,
                "instance recovered"
            ),
            (false, _) if !ok => tracing::debug!(
                service = %health.service_id,
                failures = health.consecutive_failures,
                threshold,
                "probe failure absorbed"
            ),
            _ => {}
        }
    }

    fn persist(&self, snapshots: &[ServiceHealth]) {
        let mut store = self.store.lock();
        for health in snapshots {
            if let Err(e) = store.save_health(health) {
                tracing::warn!(service = %health.service_id, error = %e, "failed to persist health snapshot");
            }
        }
    }

    fn announce(&self, t: Transition) {
        tracing::warn!(group = %t.group, from = %t.from, to = %t.to, serving = %t.serving, "HA state changed");
        self.events.publish(
            EventKind::HaStateChanged,
            json!({
                "group": t.group,
                "from": t.from,
                "to": t.to,
                "serving": t.serving,
            }),
        );

        if t.to == HaState::FailoverActive {
            self.events.publish(
                EventKind::FallbackNotice,
                json!({
                    "group": t.group,
                    "serving": Role::Standby,
                    "message": "primary unhealthy, standby serving",
                }),
            );
            self.trigger_sync(t.group);
        }
    }

    /// Fire-and-forget; the health loop never waits on replication.
    fn trigger_sync(&self, group: String) {
        let sync = Arc::clone(&self.sync);
        tokio::spawn(async move {
            tracing::info!(%group, "requesting state sync to standby");
            match sync.sync_to_standby(&group).await {
                Ok(()) => tracing::info!(%group, "state sync to standby complete"),
                Err(e) => tracing::error!(%group, error = %e, "state sync to standby failed"),
            }
        });
    }
}

struct TickFlag<'a>(&'a AtomicBool);

impl Drop for TickFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
