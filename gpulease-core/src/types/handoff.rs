use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{ServiceId, Timestamp};

/// Direction of a supervised GPU transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandoffKind {
    PrimeToStudy,
    StudyToPrime,
}

impl HandoffKind {
    /// Service giving up the accelerator
    pub fn source(self) -> ServiceId {
        match self {
            HandoffKind::PrimeToStudy => ServiceId::prime(),
            HandoffKind::StudyToPrime => ServiceId::study(),
        }
    }

    /// Service receiving the accelerator
    pub fn target(self) -> ServiceId {
        match self {
            HandoffKind::PrimeToStudy => ServiceId::study(),
            HandoffKind::StudyToPrime => ServiceId::prime(),
        }
    }

    /// Lease reason recorded for the target once the transfer commits
    pub fn target_reason(self) -> &'static str {
        match self {
            HandoffKind::PrimeToStudy => "training",
            HandoffKind::StudyToPrime => "inference",
        }
    }
}

impl fmt::Display for HandoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffKind::PrimeToStudy => write!(f, "PRIME_TO_STUDY"),
            HandoffKind::StudyToPrime => write!(f, "STUDY_TO_PRIME"),
        }
    }
}

impl FromStr for HandoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PRIME_TO_STUDY" => Ok(HandoffKind::PrimeToStudy),
            "STUDY_TO_PRIME" => Ok(HandoffKind::StudyToPrime),
            other => Err(format!(
                "invalid handoff kind '{other}'. Must be one of: PRIME_TO_STUDY, STUDY_TO_PRIME"
            )),
        }
    }
}

/// Handoff protocol phases, in protocol order.
///
/// The derived `Ord` follows declaration order, so `phase < Phase::LeaseTransferred`
/// is meaningful for the non-terminal phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Initiated,
    SourceReleasing,
    CleanupWait,
    LeaseTransferred,
    TargetStarting,
    Complete,
    Failed,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed | Phase::Aborted)
    }

    /// The phase that follows on the success path, `None` for terminal phases
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Initiated => Some(Phase::SourceReleasing),
            Phase::SourceReleasing => Some(Phase::CleanupWait),
            Phase::CleanupWait => Some(Phase::LeaseTransferred),
            Phase::LeaseTransferred => Some(Phase::TargetStarting),
            Phase::TargetStarting => Some(Phase::Complete),
            Phase::Complete | Phase::Failed | Phase::Aborted => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Initiated => "INITIATED",
            Phase::SourceReleasing => "SOURCE_RELEASING",
            Phase::CleanupWait => "CLEANUP_WAIT",
            Phase::LeaseTransferred => "LEASE_TRANSFERRED",
            Phase::TargetStarting => "TARGET_STARTING",
            Phase::Complete => "COMPLETE",
            Phase::Failed => "FAILED",
            Phase::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "INITIATED" => Ok(Phase::Initiated),
            "SOURCE_RELEASING" => Ok(Phase::SourceReleasing),
            "CLEANUP_WAIT" => Ok(Phase::CleanupWait),
            "LEASE_TRANSFERRED" => Ok(Phase::LeaseTransferred),
            "TARGET_STARTING" => Ok(Phase::TargetStarting),
            "COMPLETE" => Ok(Phase::Complete),
            "FAILED" => Ok(Phase::Failed),
            "ABORTED" => Ok(Phase::Aborted),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: Phase,
    pub at: Timestamp,
}

/// Lifecycle record of one handoff. Kept forever as history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub handoff_id: Uuid,
    pub kind: HandoffKind,
    pub phase: Phase,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub error: Option<String>,
    pub phase_log: Vec<PhaseTransition>,
}

impl HandoffRecord {
    pub fn new(kind: HandoffKind, now: Timestamp) -> Self {
        Self {
            handoff_id: Uuid::new_v4(),
            kind,
            phase: Phase::Initiated,
            started_at: now,
            completed_at: None,
            error: None,
            phase_log: vec![PhaseTransition {
                phase: Phase::Initiated,
                at: now,
            }],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// True once the owner change was committed, whatever the final phase is.
    pub fn lease_committed(&self) -> bool {
        self.phase_log
            .iter()
            .any(|t| t.phase == Phase::LeaseTransferred)
    }

    /// The last non-terminal phase reached
    pub fn last_confirmed_phase(&self) -> Phase {
        self.phase_log
            .iter()
            .rev()
            .map(|t| t.phase)
            .find(|p| !p.is_terminal())
            .unwrap_or(Phase::Initiated)
    }

    pub(crate) fn advance(&mut self, phase: Phase, now: Timestamp) {
        self.phase = phase;
        self.phase_log.push(PhaseTransition { phase, at: now });
        if phase.is_terminal() {
            self.completed_at = Some(now);
        }
    }

    pub(crate) fn terminate(&mut self, phase: Phase, error: impl Into<String>, now: Timestamp) {
        self.error = Some(error.into());
        self.advance(phase, now);
    }
}
