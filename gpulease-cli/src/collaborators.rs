//! Production collaborators: workloads, accelerator monitor, probe and state
//! sync over HTTP, lifecycle via local commands.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::process::Command;

use gpulease_core::client::Collaborators;
use gpulease_core::collaborators::*;
use gpulease_core::error::{CollaboratorError, ProbeError};
use gpulease_core::handoff::HandoffCollaborators;
use gpulease_core::types::{Endpoint, ServiceId};

use crate::config::{LifecycleCommands, Settings};

pub fn build(settings: &Settings) -> anyhow::Result<Collaborators> {
    let client = Client::builder().timeout(settings.http_timeout()).build()?;

    let lifecycle = CommandLifecycle::new(
        settings
            .lifecycle
            .iter()
            .map(|(service, commands)| (ServiceId::new(service.as_str()), commands.clone()))
            .collect(),
    );

    Ok(Collaborators {
        handoff: HandoffCollaborators {
            prime: Arc::new(HttpWorkload::new(
                "prime",
                client.clone(),
                &settings.workloads.prime_url,
            )),
            study: Arc::new(HttpWorkload::new(
                "study",
                client.clone(),
                &settings.workloads.study_url,
            )),
            lifecycle: Arc::new(lifecycle),
            accelerator: Arc::new(HttpAccelerator {
                client: client.clone(),
                url: settings.accelerator.memory_url.clone(),
            }),
        },
        probe: Arc::new(HttpProbe {
            client: client.clone(),
        }),
        sync: Arc::new(HttpSync {
            client,
            url: settings.sync.url.clone(),
        }),
    })
}

fn http_error(collaborator: &str, err: reqwest::Error) -> CollaboratorError {
    CollaboratorError::new(collaborator, err.to_string())
}

/// Workload exposing `POST /quiesce`, `POST /resume` and `GET /ready`
pub struct HttpWorkload {
    name: String,
    client: Client,
    base_url: String,
}

impl HttpWorkload {
    pub fn new(name: &str, client: Client, base_url: &str) -> Self {
        Self {
            name: format!("workload:{name}"),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, path: &str) -> Result<(), CollaboratorError> {
        self.client
            .post(format!("{}/{path}", self.base_url))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| http_error(&self.name, e))?;
        Ok(())
    }
}

#[async_trait]
impl Workload for HttpWorkload {
    async fn quiesce(&self) -> Result<(), CollaboratorError> {
        self.post("quiesce").await
    }

    async fn resume(&self) -> Result<(), CollaboratorError> {
        self.post("resume").await
    }

    async fn is_ready(&self) -> Result<bool, CollaboratorError> {
        let response = self
            .client
            .get(format!("{}/ready", self.base_url))
            .send()
            .await
            .map_err(|e| http_error(&self.name, e))?;
        Ok(response.status().is_success())
    }
}

#[derive(Deserialize)]
struct MemoryReading {
    used_mb: u64,
}

pub struct HttpAccelerator {
    client: Client,
    url: String,
}

#[async_trait]
impl AcceleratorMonitor for HttpAccelerator {
    async fn resident_memory_mb(&self) -> Result<u64, CollaboratorError> {
        let reading: MemoryReading = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| http_error("accelerator", e))?
            .json()
            .await
            .map_err(|e| http_error("accelerator", e))?;
        Ok(reading.used_mb)
    }
}

/// Any 2xx from the endpoint's URL counts as alive.
pub struct HttpProbe {
    client: Client,
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), ProbeError> {
        self.client
            .get(&endpoint.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map(|_| ())
            .map_err(|e| ProbeError {
                service: endpoint.service_id.clone(),
                message: e.to_string(),
            })
    }
}

pub struct HttpSync {
    client: Client,
    url: Option<String>,
}

#[async_trait]
impl StateSync for HttpSync {
    async fn sync_to_standby(&self, group: &str) -> Result<(), CollaboratorError> {
        let Some(url) = &self.url else {
            tracing::warn!(group, "no sync endpoint configured, skipping state sync");
            return Ok(());
        };
        self.client
            .post(url)
            .json(&serde_json::json!({ "group": group }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| http_error("sync", e))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    Stop,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
        }
    }
}

/// Starts and stops services by running configured commands.
pub struct CommandLifecycle {
    commands: HashMap<ServiceId, LifecycleCommands>,
}

impl CommandLifecycle {
    pub fn new(commands: HashMap<ServiceId, LifecycleCommands>) -> Self {
        Self { commands }
    }

    async fn run(&self, service: &ServiceId, action: Action) -> Result<(), CollaboratorError> {
        let argv = self.commands.get(service).map(|c| match action {
            Action::Start => &c.start,
            Action::Stop => &c.stop,
        });
        let action = action.as_str();
        let Some((program, args)) = argv.and_then(|a| a.split_first()) else {
            tracing::debug!(%service, action, "no lifecycle command configured");
            return Ok(());
        };

        tracing::info!(%service, action, %program, "running lifecycle command");
        let status = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| CollaboratorError::new("lifecycle", format!("{program}: {e}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(CollaboratorError::new(
                "lifecycle",
                format!("{action} {service} exited with {status}"),
            ))
        }
    }
}

#[async_trait]
impl WorkloadLifecycle for CommandLifecycle {
    async fn stop(&self, service: &ServiceId) -> Result<(), CollaboratorError> {
        self.run(service, Action::Stop).await
    }

    async fn start(&self, service: &ServiceId) -> Result<(), CollaboratorError> {
        self.run(service, Action::Start).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_service_is_a_noop() {
        let lifecycle = CommandLifecycle::new(HashMap::new());
        lifecycle.start(&ServiceId::study()).await.unwrap();
        lifecycle.stop(&ServiceId::study()).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_is_reported() {
        let mut commands = HashMap::new();
        commands.insert(
            ServiceId::study(),
            LifecycleCommands {
                start: vec!["false".into()],
                stop: vec!["true".into()],
            },
        );
        let lifecycle = CommandLifecycle::new(commands);

        lifecycle.stop(&ServiceId::study()).await.unwrap();
        let err = lifecycle.start(&ServiceId::study()).await.unwrap_err();
        assert_eq!(err.collaborator, "lifecycle");
        assert!(err.message.contains("start study"), "{}", err.message);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_runs_the_stop_command() {
        let mut commands = HashMap::new();
        commands.insert(
            ServiceId::prime(),
            LifecycleCommands {
                start: vec!["true".into()],
                stop: vec!["false".into()],
            },
        );
        let lifecycle = CommandLifecycle::new(commands);

        lifecycle.start(&ServiceId::prime()).await.unwrap();
        let err = lifecycle.stop(&ServiceId::prime()).await.unwrap_err();
        assert!(err.message.contains("stop prime"), "{}", err.message);
    }

    #[tokio::test]
    async fn test_sync_without_endpoint_is_skipped() {
        let sync = HttpSync {
            client: Client::new(),
            url: None,
        };
        sync.sync_to_standby("prime").await.unwrap();
    }
}
