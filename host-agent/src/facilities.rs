// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Traits for the agent's external collaborators.
//!
//! The container runtime and host-level resources (network, storage) are
//! deliberately behind trait objects: their mechanics are outside this
//! crate, and the convergence logic is tested against in-memory
//! implementations. The same goes for the node repository and orchestrator,
//! so the updater can be exercised without HTTP.

use async_trait::async_trait;
use node_repository_client::{
    HostName, NodeRepositoryClient, NodeRepositoryError,
    ObservedStateReport, WorkloadName, WorkloadSpec, WorkloadState,
};
use orchestrator_client::{
    OrchestratorClient, OrchestratorError, SuspensionDecision,
};
use slog::{Logger, debug, o};
use std::sync::Arc;
use tokio::sync::Mutex;

/// What the container runtime reports about one container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    pub image: Option<String>,
}

/// Container runtime and host resource operations, implemented outside this
/// crate. All operations are assumed idempotent on "already in the desired
/// state".
#[async_trait]
pub trait HostFacilities: Send + Sync + 'static {
    /// Names of all containers present on the host, running or not. Used to
    /// discover containers left behind by a previous agent process.
    async fn list_containers(&self)
        -> anyhow::Result<Vec<WorkloadName>>;

    async fn inspect_container(
        &self,
        workload: &WorkloadName,
    ) -> anyhow::Result<Option<ContainerStatus>>;

    async fn start_container(
        &self,
        spec: &WorkloadSpec,
    ) -> anyhow::Result<()>;

    async fn stop_container(
        &self,
        workload: &WorkloadName,
    ) -> anyhow::Result<()>;

    async fn remove_container(
        &self,
        workload: &WorkloadName,
    ) -> anyhow::Result<()>;

    /// Set up host-level resources (network, storage, ACLs) for a workload.
    async fn configure_host_resources(
        &self,
        spec: &WorkloadSpec,
    ) -> anyhow::Result<()>;

    /// Reclaim a workload's host-level resources. Callers must only do this
    /// after the workload's container is gone.
    async fn release_host_resources(
        &self,
        workload: &WorkloadName,
    ) -> anyhow::Result<()>;
}

/// Supervisor-owned handle through which agents mutate shared host
/// resources. Mutations are serialized so two agents can never race on the
/// same host-level resource.
#[derive(Clone)]
pub struct HostResources {
    inner: Arc<HostResourcesInner>,
}

struct HostResourcesInner {
    facilities: Arc<dyn HostFacilities>,
    mutation_lock: Mutex<()>,
    log: Logger,
}

impl HostResources {
    pub fn new(facilities: Arc<dyn HostFacilities>, log: &Logger) -> Self {
        Self {
            inner: Arc::new(HostResourcesInner {
                facilities,
                mutation_lock: Mutex::new(()),
                log: log.new(o!("component" => "HostResources")),
            }),
        }
    }

    pub async fn configure(
        &self,
        spec: &WorkloadSpec,
    ) -> anyhow::Result<()> {
        let _guard = self.inner.mutation_lock.lock().await;
        debug!(
            self.inner.log, "configuring host resources";
            "workload" => %spec.name,
        );
        self.inner.facilities.configure_host_resources(spec).await
    }

    pub async fn release(
        &self,
        workload: &WorkloadName,
    ) -> anyhow::Result<()> {
        let _guard = self.inner.mutation_lock.lock().await;
        debug!(
            self.inner.log, "releasing host resources";
            "workload" => %workload,
        );
        self.inner.facilities.release_host_resources(workload).await
    }
}

/// The node repository as seen by the agent.
#[async_trait]
pub trait WorkloadSource: Send + Sync + 'static {
    async fn list_workloads(
        &self,
        host: &HostName,
    ) -> Result<Vec<WorkloadSpec>, NodeRepositoryError>;

    async fn report_observed_state(
        &self,
        workload: &WorkloadName,
        report: &ObservedStateReport,
    ) -> Result<(), NodeRepositoryError>;

    async fn set_workload_state(
        &self,
        workload: &WorkloadName,
        state: WorkloadState,
    ) -> Result<(), NodeRepositoryError>;
}

#[async_trait]
impl WorkloadSource for NodeRepositoryClient {
    async fn list_workloads(
        &self,
        host: &HostName,
    ) -> Result<Vec<WorkloadSpec>, NodeRepositoryError> {
        NodeRepositoryClient::list_workloads(self, host).await
    }

    async fn report_observed_state(
        &self,
        workload: &WorkloadName,
        report: &ObservedStateReport,
    ) -> Result<(), NodeRepositoryError> {
        NodeRepositoryClient::report_observed_state(self, workload, report)
            .await
    }

    async fn set_workload_state(
        &self,
        workload: &WorkloadName,
        state: WorkloadState,
    ) -> Result<(), NodeRepositoryError> {
        NodeRepositoryClient::set_workload_state(self, workload, state)
            .await
    }
}

/// The orchestrator as seen by the agent.
#[async_trait]
pub trait ClusterController: Send + Sync + 'static {
    async fn request_host_suspension(
        &self,
        host: &HostName,
    ) -> Result<SuspensionDecision, OrchestratorError>;

    async fn resume_host(
        &self,
        host: &HostName,
    ) -> Result<(), OrchestratorError>;

    async fn request_workload_suspension(
        &self,
        host: &HostName,
        workload: &WorkloadName,
    ) -> Result<SuspensionDecision, OrchestratorError>;

    async fn resume_workload(
        &self,
        host: &HostName,
        workload: &WorkloadName,
    ) -> Result<(), OrchestratorError>;
}

#[async_trait]
impl ClusterController for OrchestratorClient {
    async fn request_host_suspension(
        &self,
        host: &HostName,
    ) -> Result<SuspensionDecision, OrchestratorError> {
        OrchestratorClient::request_host_suspension(self, host).await
    }

    async fn resume_host(
        &self,
        host: &HostName,
    ) -> Result<(), OrchestratorError> {
        OrchestratorClient::resume_host(self, host).await
    }

    async fn request_workload_suspension(
        &self,
        host: &HostName,
        workload: &WorkloadName,
    ) -> Result<SuspensionDecision, OrchestratorError> {
        OrchestratorClient::request_workload_suspension(
            self, host, workload,
        )
        .await
    }

    async fn resume_workload(
        &self,
        host: &HostName,
        workload: &WorkloadName,
    ) -> Result<(), OrchestratorError> {
        OrchestratorClient::resume_workload(self, host, workload).await
    }
}
