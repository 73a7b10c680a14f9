use serde::{Deserialize, Serialize};

use gpulease_core::types::{GpuLease, HandoffKind, ServiceId};

// ─── Validation Helpers ─────────────────────────────────────────────────────

/// Upper bound accepted for a client-supplied `max_wait_ms`
pub const MAX_WAIT_CEILING_MS: u64 = 10 * 60 * 1000;

pub fn validate_service(service: &str) -> Result<(), String> {
    if service.trim().is_empty() {
        return Err("service is required".to_string());
    }
    if !service
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(format!(
            "Invalid service '{service}'. Use letters, digits, '-' or '_'"
        ));
    }
    Ok(())
}

// ─── Request Types ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AcquireLeaseRequest {
    pub service: String,
    pub reason: String,
    /// Falls back to the registry's configured default
    pub max_wait_ms: Option<u64>,
}

impl AcquireLeaseRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_service(&self.service)?;
        if self.reason.trim().is_empty() {
            return Err("reason is required".to_string());
        }
        match self.max_wait_ms {
            Some(0) => Err("max_wait_ms must be greater than 0".to_string()),
            Some(ms) if ms > MAX_WAIT_CEILING_MS => Err(format!(
                "max_wait_ms must not exceed {MAX_WAIT_CEILING_MS}"
            )),
            _ => Ok(()),
        }
    }

    pub fn service_id(&self) -> ServiceId {
        ServiceId::new(self.service.as_str())
    }
}

#[derive(Deserialize)]
pub struct StartHandoffRequest {
    pub kind: String,
}

impl StartHandoffRequest {
    pub fn parse(&self) -> Result<HandoffKind, String> {
        self.kind.parse()
    }
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub lease_owner: Option<ServiceId>,
    pub queue_depth: usize,
    pub active_handoff: Option<uuid::Uuid>,
}

#[derive(Serialize)]
pub struct ReleaseResponse {
    /// Lease granted to the next queued caller, if any
    pub next: Option<GpuLease>,
}

#[derive(Serialize)]
pub struct ForceReleaseResponse {
    pub released: Option<GpuLease>,
    pub next: Option<GpuLease>,
}
