// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed client for the node repository.
//!
//! The node repository is the authority for which workloads a host should be
//! running. This crate owns the wire types for that protocol and a thin
//! façade over [`failover_client::FailoverClient`]; retry-across-peers
//! behavior lives entirely in the transport layer.

use chrono::{DateTime, Utc};
use failover_client::FailoverClient;
use reqwest::StatusCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::{Logger, debug, o};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
#[error("invalid name {name:?}: {reason}")]
pub struct InvalidNameError {
    name: String,
    reason: &'static str,
}

fn validate_name(name: &str) -> Result<(), InvalidNameError> {
    if name.is_empty() {
        return Err(InvalidNameError {
            name: name.to_string(),
            reason: "name is empty",
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
    {
        return Err(InvalidNameError {
            name: name.to_string(),
            reason: "name contains characters outside [a-zA-Z0-9.-_]",
        });
    }
    Ok(())
}

/// Hostname of the physical host this agent runs on. Immutable for the
/// process lifetime.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct HostName(String);

impl HostName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for HostName {
    type Err = InvalidNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_name(s)?;
        Ok(HostName(s.to_string()))
    }
}

impl fmt::Display for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of one workload assigned to a host; doubles as the container name.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct WorkloadName(String);

impl WorkloadName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for WorkloadName {
    type Err = InvalidNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_name(s)?;
        Ok(WorkloadName(s.to_string()))
    }
}

impl fmt::Display for WorkloadName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a workload, owned by the node repository.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadState {
    /// Assigned to the host but not yet activated.
    Requested,
    /// Should be running.
    Active,
    /// Taken out of service; no container should run.
    Inactive,
    /// Being decommissioned; the host must tear it down.
    Dirty,
    /// Cleaned up and available for reallocation. Set by the host agent
    /// once a dirty workload's teardown is complete.
    Ready,
}

impl WorkloadState {
    /// Whether this state calls for a running container on the host.
    pub fn requires_container(&self) -> bool {
        matches!(self, WorkloadState::Requested | WorkloadState::Active)
    }
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadState::Requested => "requested",
            WorkloadState::Active => "active",
            WorkloadState::Inactive => "inactive",
            WorkloadState::Dirty => "dirty",
            WorkloadState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Desired-state record for one workload, as declared by the node
/// repository. Read-only to the host agent: the agent reports observed state
/// back but never mutates desired state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkloadSpec {
    pub name: WorkloadName,
    pub state: WorkloadState,
    /// Owning tenant, if the workload has been allocated.
    pub tenant: Option<String>,
    /// Container image reference the workload should run.
    pub wanted_image: Option<String>,
    pub min_cpu_cores: f64,
    pub min_main_memory_gb: f64,
    pub min_disk_gb: f64,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddr>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetWorkloadsResponse {
    pub workloads: Vec<WorkloadSpec>,
}

/// Actual per-workload state as last converged by the host agent, reported
/// back to the node repository.
#[derive(
    Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema,
)]
pub struct ObservedStateReport {
    pub container_exists: bool,
    pub container_running: bool,
    pub last_converged: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct UpdateResponse {
    pub message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeRepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("transient node repository failure")]
    Transient(#[source] failover_client::Error),
}

impl NodeRepositoryError {
    fn from_transport(err: failover_client::Error) -> Self {
        let message =
            || err.message().unwrap_or("(no detail)").to_string();
        match err.status() {
            Some(StatusCode::NOT_FOUND) => {
                NodeRepositoryError::NotFound(message())
            }
            Some(StatusCode::CONFLICT) => {
                NodeRepositoryError::Conflict(message())
            }
            Some(StatusCode::FORBIDDEN) | Some(StatusCode::UNAUTHORIZED) => {
                NodeRepositoryError::Forbidden(message())
            }
            _ => NodeRepositoryError::Transient(err),
        }
    }
}

/// Client for the node repository API hosted on the config servers.
pub struct NodeRepositoryClient {
    transport: Arc<FailoverClient>,
    log: Logger,
}

impl NodeRepositoryClient {
    pub fn new(transport: Arc<FailoverClient>, log: &Logger) -> Self {
        Self {
            transport,
            log: log.new(o!("component" => "NodeRepositoryClient")),
        }
    }

    /// The workloads currently assigned to `host`, in all lifecycle states.
    pub async fn list_workloads(
        &self,
        host: &HostName,
    ) -> Result<Vec<WorkloadSpec>, NodeRepositoryError> {
        let response: GetWorkloadsResponse = self
            .transport
            .get(&format!("/nodes/v2/node/{host}"))
            .await
            .map_err(NodeRepositoryError::from_transport)?;
        debug!(
            self.log, "listed workloads";
            "host" => %host,
            "count" => response.workloads.len(),
        );
        Ok(response.workloads)
    }

    /// Report the locally observed state of one workload.
    pub async fn report_observed_state(
        &self,
        workload: &WorkloadName,
        report: &ObservedStateReport,
    ) -> Result<(), NodeRepositoryError> {
        let _: UpdateResponse = self
            .transport
            .patch(&format!("/nodes/v2/node/{workload}"), report)
            .await
            .map_err(NodeRepositoryError::from_transport)?;
        Ok(())
    }

    /// Ask the repository to move a workload to a new lifecycle state, e.g.
    /// marking a torn-down workload ready for reallocation.
    pub async fn set_workload_state(
        &self,
        workload: &WorkloadName,
        state: WorkloadState,
    ) -> Result<(), NodeRepositoryError> {
        let _: UpdateResponse = self
            .transport
            .put(
                &format!("/nodes/v2/state/{state}/{workload}"),
                None::<&()>,
            )
            .await
            .map_err(NodeRepositoryError::from_transport)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn workload_spec_wire_format() {
        let json = r#"{
            "name": "tenant1-node3.example.com",
            "state": "active",
            "tenant": "tenant1",
            "wanted_image": "registry.example.com/app:7.32.1",
            "min_cpu_cores": 4.0,
            "min_main_memory_gb": 16.0,
            "min_disk_gb": 250.0,
            "ip_addresses": ["10.0.3.7"]
        }"#;
        let spec: WorkloadSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.state, WorkloadState::Active);
        assert!(spec.state.requires_container());
        assert_eq!(
            spec.wanted_image.as_deref(),
            Some("registry.example.com/app:7.32.1")
        );
    }

    #[test]
    fn state_round_trips_through_display() {
        for state in [
            WorkloadState::Requested,
            WorkloadState::Active,
            WorkloadState::Inactive,
            WorkloadState::Dirty,
            WorkloadState::Ready,
        ] {
            let wire = serde_json::to_string(&state).unwrap();
            assert_eq!(wire, format!("\"{state}\""));
        }
    }

    #[test]
    fn name_validation() {
        assert!("host-3.example.com".parse::<HostName>().is_ok());
        assert!("".parse::<HostName>().is_err());
        assert!("bad name".parse::<WorkloadName>().is_err());
        assert!("../escape".parse::<WorkloadName>().is_err());
    }

    #[test]
    fn inactive_and_dirty_do_not_require_containers() {
        assert!(!WorkloadState::Inactive.requires_container());
        assert!(!WorkloadState::Dirty.requires_container());
        assert!(!WorkloadState::Ready.requires_container());
    }
}
