use serde::{Deserialize, Serialize};

use super::{HaState, HealthStatus, Role, ServiceId, Timestamp};

/// A probe-able service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub service_id: ServiceId,
    /// Liveness URL (or any address the probe implementation understands)
    pub url: String,
}

impl Endpoint {
    pub fn new(service_id: impl Into<ServiceId>, url: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            url: url.into(),
        }
    }
}

/// A monitored primary/standby pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub name: String,
    pub primary: Endpoint,
    pub standby: Endpoint,
}

/// Debounced liveness of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_id: ServiceId,
    pub role: Role,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<Timestamp>,
    pub status: HealthStatus,
}

impl ServiceHealth {
    /// Instances start healthy until proven otherwise.
    pub fn new(service_id: ServiceId, role: Role) -> Self {
        Self {
            service_id,
            role,
            consecutive_failures: 0,
            last_checked_at: None,
            status: HealthStatus::Healthy,
        }
    }

    /// Fold one probe outcome into the counter. Returns true if the status flipped.
    pub fn record_probe(&mut self, ok: bool, failure_threshold: u32, now: Timestamp) -> bool {
        let before = self.status;
        self.last_checked_at = Some(now);
        if ok {
            self.consecutive_failures = 0;
            self.status = HealthStatus::Healthy;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= failure_threshold {
                self.status = HealthStatus::Unhealthy;
            }
        }
        before != self.status
    }
}

/// Watchdog view of one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupHealth {
    pub group: String,
    pub primary: ServiceHealth,
    pub standby: ServiceHealth,
    pub ha_state: HaState,
    /// Instance currently serving traffic. Stays `Standby` after a failover
    /// until an operator fails back.
    pub serving: Role,
}
