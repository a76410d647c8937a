// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed client for the cluster orchestrator.
//!
//! The orchestrator arbitrates disruptive operations across the cluster: a
//! host (or a single workload) may only be taken out of traffic once the
//! orchestrator grants a suspension. Denial is an expected steady-state
//! answer, so it is modeled as a value ([`SuspensionDecision::Denied`]), not
//! an error.

use failover_client::FailoverClient;
use node_repository_client::{HostName, WorkloadName};
use reqwest::StatusCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::{Logger, info, o};
use std::sync::Arc;

/// The orchestrator's answer to a suspension request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuspensionDecision {
    Allowed,
    Denied { reason: String },
}

impl SuspensionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SuspensionDecision::Allowed)
    }
}

/// Wire form of a suspension decision.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SuspensionResponse {
    pub allowed: bool,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct ResumeResponse {
    pub message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown host or workload: {0}")]
    NotFound(String),

    #[error("transient orchestrator failure")]
    Transient(#[source] failover_client::Error),
}

/// Client for the orchestrator API hosted on the config servers.
pub struct OrchestratorClient {
    transport: Arc<FailoverClient>,
    log: Logger,
}

impl OrchestratorClient {
    pub fn new(transport: Arc<FailoverClient>, log: &Logger) -> Self {
        Self {
            transport,
            log: log.new(o!("component" => "OrchestratorClient")),
        }
    }

    /// Ask permission to take the whole host out of traffic.
    pub async fn request_host_suspension(
        &self,
        host: &HostName,
    ) -> Result<SuspensionDecision, OrchestratorError> {
        self.request_suspension(
            format!("/orchestrator/v1/suspensions/hosts/{host}"),
        )
        .await
    }

    /// Return the host to normal rotation, releasing its suspension.
    pub async fn resume_host(
        &self,
        host: &HostName,
    ) -> Result<(), OrchestratorError> {
        let _: ResumeResponse = self
            .transport
            .delete(&format!("/orchestrator/v1/suspensions/hosts/{host}"))
            .await
            .map_err(Self::map_err)?;
        info!(self.log, "host resumed"; "host" => %host);
        Ok(())
    }

    /// Ask permission to disrupt a single workload while the host itself
    /// stays in traffic.
    pub async fn request_workload_suspension(
        &self,
        host: &HostName,
        workload: &WorkloadName,
    ) -> Result<SuspensionDecision, OrchestratorError> {
        self.request_suspension(format!(
            "/orchestrator/v1/suspensions/hosts/{host}/workloads/{workload}"
        ))
        .await
    }

    /// Return a workload to traffic, releasing its suspension. A granted
    /// workload suspension must always be paired with this once the
    /// disruptive operation is over; otherwise the orchestrator keeps the
    /// workload booked as out of service.
    pub async fn resume_workload(
        &self,
        host: &HostName,
        workload: &WorkloadName,
    ) -> Result<(), OrchestratorError> {
        let _: ResumeResponse = self
            .transport
            .delete(&format!(
                "/orchestrator/v1/suspensions/hosts/{host}\
                 /workloads/{workload}"
            ))
            .await
            .map_err(Self::map_err)?;
        info!(
            self.log, "workload resumed";
            "host" => %host,
            "workload" => %workload,
        );
        Ok(())
    }

    async fn request_suspension(
        &self,
        path: String,
    ) -> Result<SuspensionDecision, OrchestratorError> {
        let result: Result<SuspensionResponse, _> =
            self.transport.put(&path, None::<&()>).await;
        match result {
            Ok(response) if response.allowed => {
                Ok(SuspensionDecision::Allowed)
            }
            Ok(response) => Ok(SuspensionDecision::Denied {
                reason: response
                    .reason
                    .unwrap_or_else(|| "no reason given".to_string()),
            }),
            // Some orchestrator builds answer denial with 409 rather than a
            // body; fold that into the same decision.
            Err(err) if err.status() == Some(StatusCode::CONFLICT) => {
                Ok(SuspensionDecision::Denied {
                    reason: err
                        .message()
                        .unwrap_or("suspension conflict")
                        .to_string(),
                })
            }
            Err(err) => Err(Self::map_err(err)),
        }
    }

    fn map_err(err: failover_client::Error) -> OrchestratorError {
        match err.status() {
            Some(StatusCode::NOT_FOUND) => OrchestratorError::NotFound(
                err.message().unwrap_or("(no detail)").to_string(),
            ),
            _ => OrchestratorError::Transient(err),
        }
    }
}
