use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

pub fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shortest period accepted for polling loops; `tokio::time::interval` panics on zero.
pub const MIN_POLL_PERIOD: Duration = Duration::from_millis(1);

pub fn poll_period(period: Duration) -> Duration {
    period.max(MIN_POLL_PERIOD)
}

/// Stable identifier of a service that can hold the accelerator or be probed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// The inference service.
    pub const PRIME: &'static str = "prime";
    /// The training/embedding service.
    pub const STUDY: &'static str = "study";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn prime() -> Self {
        Self::new(Self::PRIME)
    }

    pub fn study() -> Self {
        Self::new(Self::STUDY)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ServiceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Position of an instance inside a primary/standby pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Primary,
    Standby,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "PRIMARY"),
            Role::Standby => write!(f, "STANDBY"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PRIMARY" => Ok(Role::Primary),
            "STANDBY" => Ok(Role::Standby),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HEALTHY" => Ok(HealthStatus::Healthy),
            "UNHEALTHY" => Ok(HealthStatus::Unhealthy),
            other => Err(format!("unknown health status '{other}'")),
        }
    }
}

/// Aggregate availability of a primary/standby pair.
///
/// Always recomputable from the two [`HealthStatus`] values, see [`HaState::derive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HaState {
    Active,
    Degraded,
    FailoverActive,
    Failed,
}

impl HaState {
    pub fn derive(primary: HealthStatus, standby: HealthStatus) -> Self {
        use HealthStatus::*;
        match (primary, standby) {
            (Healthy, Healthy) => HaState::Active,
            (Healthy, Unhealthy) => HaState::Degraded,
            (Unhealthy, Healthy) => HaState::FailoverActive,
            (Unhealthy, Unhealthy) => HaState::Failed,
        }
    }
}

impl fmt::Display for HaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaState::Active => write!(f, "ACTIVE"),
            HaState::Degraded => write!(f, "DEGRADED"),
            HaState::FailoverActive => write!(f, "FAILOVER_ACTIVE"),
            HaState::Failed => write!(f, "FAILED"),
        }
    }
}
