use thiserror::Error;
use uuid::Uuid;

use crate::types::{Phase, ServiceId};

pub type Result<T> = std::result::Result<T, Error>;

/// Message stored on handoff records that were cut short by a process restart.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

#[derive(Debug, Error)]
pub enum Error {
    /// An acquire wait or a handoff phase exceeded its bound. Retryable.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("'{caller}' does not own the GPU lease (held by {held_by:?})")]
    NotOwner {
        /// Service id or lease id presented by the caller
        caller: String,
        held_by: Option<ServiceId>,
    },

    #[error("handoff {active} is still in progress")]
    HandoffInProgress { active: Uuid },

    #[error("{}", INTERRUPTED_BY_RESTART)]
    InterruptedByRestart,

    #[error("handoff {handoff_id} failed during {phase}: {reason}")]
    HandoffFailed {
        handoff_id: Uuid,
        phase: Phase,
        /// The owner change was already committed and is not rolled back
        lease_committed: bool,
        /// Full failure message as stored on the record
        reason: String,
        #[source]
        cause: Box<Error>,
    },

    #[error("handoff {0} not found")]
    HandoffNotFound(Uuid),

    #[error("handoff {handoff_id} already reached {phase}; the lease transfer is committed")]
    AbortTooLate { handoff_id: Uuid, phase: Phase },

    #[error("unknown service group '{0}'")]
    UnknownGroup(String),

    #[error("primary of group '{0}' is not healthy; refusing to fail back")]
    PrimaryUnhealthy(String),

    #[error("lease wait was cancelled")]
    Cancelled,

    #[error("aborted by operator")]
    Aborted,

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// The underlying error of a failed handoff, or `self` for anything else
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::HandoffFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }
}

/// Failure reported by an external collaborator (workload, lifecycle manager, sync).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{collaborator}: {message}")]
pub struct CollaboratorError {
    pub collaborator: String,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }
}

/// A liveness probe did not succeed. Absorbed by the watchdog's failure counter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("probe of {service} failed: {message}")]
pub struct ProbeError {
    pub service: ServiceId,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "sqlite")]
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}
