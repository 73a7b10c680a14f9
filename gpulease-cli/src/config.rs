//! YAML configuration for `gpulease serve`. Every field has a default, so an
//! empty file (or no file) gives a working single-host setup.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use gpulease_core::client::OrchestratorConfig;
use gpulease_core::events::DEFAULT_EVENT_CAPACITY;
use gpulease_core::handoff::{HandoffConfig, PhaseTimeouts};
use gpulease_core::registry::RegistryConfig;
use gpulease_core::types::{HandoffKind, ServiceGroup};
use gpulease_core::watchdog::WatchdogConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub registry: RegistrySettings,
    pub handoff: HandoffSettings,
    pub watchdog: WatchdogSettings,
    pub event_capacity: usize,
    pub workloads: WorkloadSettings,
    pub accelerator: AcceleratorSettings,
    /// Per-service start/stop commands, keyed by service id
    pub lifecycle: HashMap<String, LifecycleCommands>,
    pub sync: SyncSettings,
    pub groups: Vec<ServiceGroup>,
    /// Timeout applied to every outgoing HTTP call
    pub http_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry: RegistrySettings::default(),
            handoff: HandoffSettings::default(),
            watchdog: WatchdogSettings::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            workloads: WorkloadSettings::default(),
            accelerator: AcceleratorSettings::default(),
            lifecycle: HashMap::new(),
            sync: SyncSettings::default(),
            groups: Vec::new(),
            http_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub default_max_wait_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_max_wait_ms: millis(RegistryConfig::default().default_max_wait),
        }
    }
}

/// Unset fields fall back to the direction's own default
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub source_release_ms: Option<u64>,
    pub cleanup_ms: Option<u64>,
    pub target_start_ms: Option<u64>,
}

impl TimeoutSettings {
    fn to_timeouts(&self, kind: HandoffKind) -> PhaseTimeouts {
        let defaults = PhaseTimeouts::defaults_for(kind);
        let pick = |ms: Option<u64>, fallback: Duration| ms.map(Duration::from_millis).unwrap_or(fallback);
        PhaseTimeouts {
            source_release: pick(self.source_release_ms, defaults.source_release),
            cleanup: pick(self.cleanup_ms, defaults.cleanup),
            target_start: pick(self.target_start_ms, defaults.target_start),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandoffSettings {
    pub prime_to_study: TimeoutSettings,
    pub study_to_prime: TimeoutSettings,
    pub idle_memory_threshold_mb: u64,
    pub cleanup_poll_interval_ms: u64,
    pub readiness_poll_interval_ms: u64,
    pub rollback_timeout_ms: u64,
}

impl Default for HandoffSettings {
    fn default() -> Self {
        let core = HandoffConfig::default();
        Self {
            prime_to_study: TimeoutSettings::default(),
            study_to_prime: TimeoutSettings::default(),
            idle_memory_threshold_mb: core.idle_memory_threshold_mb,
            cleanup_poll_interval_ms: millis(core.cleanup_poll_interval),
            readiness_poll_interval_ms: millis(core.readiness_poll_interval),
            rollback_timeout_ms: millis(core.rollback_timeout),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub tick_ms: u64,
    pub probe_timeout_ms: u64,
    pub failure_threshold: u32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        let core = WatchdogConfig::default();
        Self {
            tick_ms: millis(core.tick),
            probe_timeout_ms: millis(core.probe_timeout),
            failure_threshold: core.failure_threshold,
        }
    }
}

/// Control endpoints of the two workloads (`/quiesce`, `/resume`, `/ready`)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkloadSettings {
    pub prime_url: String,
    pub study_url: String,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            prime_url: "http://127.0.0.1:8000".into(),
            study_url: "http://127.0.0.1:8001".into(),
        }
    }
}

/// Endpoint answering `{"used_mb": <n>}`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcceleratorSettings {
    pub memory_url: String,
}

impl Default for AcceleratorSettings {
    fn default() -> Self {
        Self {
            memory_url: "http://127.0.0.1:9400/memory".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LifecycleCommands {
    /// argv, e.g. `["systemctl", "start", "study"]`
    pub start: Vec<String>,
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Unset disables state sync; failovers are still reported.
    pub url: Option<String>,
}

impl Settings {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            tracing::info!("no config file given, using defaults");
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{path}'"))?;
        let settings = Self::parse(&raw).with_context(|| format!("invalid config file '{path}'"))?;
        tracing::info!(path, groups = settings.groups.len(), "configuration loaded");
        Ok(settings)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Self = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.watchdog.failure_threshold == 0 {
            anyhow::bail!("watchdog.failure_threshold must be at least 1");
        }
        let durations = [
            ("watchdog.tick_ms", self.watchdog.tick_ms),
            ("watchdog.probe_timeout_ms", self.watchdog.probe_timeout_ms),
            ("handoff.cleanup_poll_interval_ms", self.handoff.cleanup_poll_interval_ms),
            ("handoff.readiness_poll_interval_ms", self.handoff.readiness_poll_interval_ms),
            ("handoff.rollback_timeout_ms", self.handoff.rollback_timeout_ms),
            ("http_timeout_ms", self.http_timeout_ms),
        ];
        for (field, ms) in durations {
            if ms == 0 {
                anyhow::bail!("{field} must be greater than 0");
            }
        }
        for (direction, timeouts) in [
            ("prime_to_study", &self.handoff.prime_to_study),
            ("study_to_prime", &self.handoff.study_to_prime),
        ] {
            let phases = [
                ("source_release_ms", timeouts.source_release_ms),
                ("cleanup_ms", timeouts.cleanup_ms),
                ("target_start_ms", timeouts.target_start_ms),
            ];
            for (field, ms) in phases {
                if ms == Some(0) {
                    anyhow::bail!("handoff.{direction}.{field} must be greater than 0");
                }
            }
        }
        Ok(())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            registry: RegistryConfig {
                default_max_wait: Duration::from_millis(self.registry.default_max_wait_ms),
            },
            handoff: HandoffConfig {
                prime_to_study: self.handoff.prime_to_study.to_timeouts(HandoffKind::PrimeToStudy),
                study_to_prime: self.handoff.study_to_prime.to_timeouts(HandoffKind::StudyToPrime),
                idle_memory_threshold_mb: self.handoff.idle_memory_threshold_mb,
                cleanup_poll_interval: Duration::from_millis(self.handoff.cleanup_poll_interval_ms),
                readiness_poll_interval: Duration::from_millis(
                    self.handoff.readiness_poll_interval_ms,
                ),
                rollback_timeout: Duration::from_millis(self.handoff.rollback_timeout_ms),
            },
            watchdog: WatchdogConfig {
                tick: Duration::from_millis(self.watchdog.tick_ms),
                probe_timeout: Duration::from_millis(self.watchdog.probe_timeout_ms),
                failure_threshold: self.watchdog.failure_threshold,
            },
            event_capacity: self.event_capacity,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
