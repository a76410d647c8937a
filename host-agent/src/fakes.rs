// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test doubles for the node repository and orchestrator.

use crate::facilities::{ClusterController, WorkloadSource};
use async_trait::async_trait;
use node_repository_client::{
    HostName, NodeRepositoryError, ObservedStateReport, WorkloadName,
    WorkloadSpec, WorkloadState,
};
use orchestrator_client::{OrchestratorError, SuspensionDecision};
use slog::{Logger, o};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub(crate) fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// In-memory stand-in for the node repository.
#[derive(Default)]
pub(crate) struct FakeRepository {
    workloads: Mutex<Vec<WorkloadSpec>>,
    reports: Mutex<BTreeMap<String, ObservedStateReport>>,
    states: Mutex<BTreeMap<String, WorkloadState>>,
    fail_list: AtomicBool,
    fail_report: AtomicBool,
    fail_state_updates: AtomicBool,
    list_calls: AtomicUsize,
}

impl FakeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_workloads(&self, workloads: Vec<WorkloadSpec>) {
        *self.workloads.lock().unwrap() = workloads;
    }

    pub fn fail_listing(&self) {
        self.fail_list.store(true, Ordering::SeqCst);
    }

    pub fn restore_listing(&self) {
        self.fail_list.store(false, Ordering::SeqCst);
    }

    pub fn fail_reports(&self) {
        self.fail_report.store(true, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn last_report(
        &self,
        workload: &str,
    ) -> Option<ObservedStateReport> {
        self.reports.lock().unwrap().get(workload).cloned()
    }

    pub fn fail_state_updates(&self) {
        self.fail_state_updates.store(true, Ordering::SeqCst);
    }

    pub fn restore_state_updates(&self) {
        self.fail_state_updates.store(false, Ordering::SeqCst);
    }

    /// The last lifecycle state the agent pushed for `workload`, if any.
    pub fn pushed_state(&self, workload: &str) -> Option<WorkloadState> {
        self.states.lock().unwrap().get(workload).copied()
    }
}

#[async_trait]
impl WorkloadSource for FakeRepository {
    async fn list_workloads(
        &self,
        _host: &HostName,
    ) -> Result<Vec<WorkloadSpec>, NodeRepositoryError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(NodeRepositoryError::Transient(
                failover_client::Error::NoPeers,
            ));
        }
        Ok(self.workloads.lock().unwrap().clone())
    }

    async fn report_observed_state(
        &self,
        workload: &WorkloadName,
        report: &ObservedStateReport,
    ) -> Result<(), NodeRepositoryError> {
        if self.fail_report.load(Ordering::SeqCst) {
            return Err(NodeRepositoryError::Transient(
                failover_client::Error::NoPeers,
            ));
        }
        self.reports
            .lock()
            .unwrap()
            .insert(workload.as_str().to_string(), report.clone());
        Ok(())
    }

    async fn set_workload_state(
        &self,
        workload: &WorkloadName,
        state: WorkloadState,
    ) -> Result<(), NodeRepositoryError> {
        if self.fail_state_updates.load(Ordering::SeqCst) {
            return Err(NodeRepositoryError::Transient(
                failover_client::Error::NoPeers,
            ));
        }
        self.states
            .lock()
            .unwrap()
            .insert(workload.as_str().to_string(), state);
        Ok(())
    }
}

/// In-memory stand-in for the orchestrator. Allows every suspension unless
/// told otherwise, and records how often it was asked.
#[derive(Default)]
pub(crate) struct FakeController {
    deny_reason: Mutex<Option<String>>,
    fail_requests: AtomicBool,
    fail_resumes: AtomicBool,
    hang_host_suspension: AtomicBool,
    host_suspensions: AtomicUsize,
    workload_suspensions: AtomicUsize,
    resumes: AtomicUsize,
    workload_resumes: AtomicUsize,
}

impl FakeController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_all(&self, reason: &str) {
        *self.deny_reason.lock().unwrap() = Some(reason.to_string());
    }

    pub fn allow_all(&self) {
        *self.deny_reason.lock().unwrap() = None;
    }

    pub fn fail_requests(&self) {
        self.fail_requests.store(true, Ordering::SeqCst);
    }

    pub fn restore_requests(&self) {
        self.fail_requests.store(false, Ordering::SeqCst);
    }

    /// Fail only the resume call, leaving suspension requests working.
    pub fn fail_resumes(&self) {
        self.fail_resumes.store(true, Ordering::SeqCst);
    }

    pub fn restore_resumes(&self) {
        self.fail_resumes.store(false, Ordering::SeqCst);
    }

    /// Make host suspension requests block forever, to exercise caller
    /// timeouts.
    pub fn hang_host_suspensions(&self) {
        self.hang_host_suspension.store(true, Ordering::SeqCst);
    }

    pub fn host_suspension_requests(&self) -> usize {
        self.host_suspensions.load(Ordering::SeqCst)
    }

    pub fn workload_suspension_requests(&self) -> usize {
        self.workload_suspensions.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn workload_resume_calls(&self) -> usize {
        self.workload_resumes.load(Ordering::SeqCst)
    }

    fn decision(&self) -> Result<SuspensionDecision, OrchestratorError> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Transient(
                failover_client::Error::NoPeers,
            ));
        }
        match self.deny_reason.lock().unwrap().clone() {
            Some(reason) => Ok(SuspensionDecision::Denied { reason }),
            None => Ok(SuspensionDecision::Allowed),
        }
    }
}

#[async_trait]
impl ClusterController for FakeController {
    async fn request_host_suspension(
        &self,
        _host: &HostName,
    ) -> Result<SuspensionDecision, OrchestratorError> {
        self.host_suspensions.fetch_add(1, Ordering::SeqCst);
        if self.hang_host_suspension.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.decision()
    }

    async fn resume_host(
        &self,
        _host: &HostName,
    ) -> Result<(), OrchestratorError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        if self.fail_requests.load(Ordering::SeqCst)
            || self.fail_resumes.load(Ordering::SeqCst)
        {
            return Err(OrchestratorError::Transient(
                failover_client::Error::NoPeers,
            ));
        }
        Ok(())
    }

    async fn request_workload_suspension(
        &self,
        _host: &HostName,
        _workload: &WorkloadName,
    ) -> Result<SuspensionDecision, OrchestratorError> {
        self.workload_suspensions.fetch_add(1, Ordering::SeqCst);
        self.decision()
    }

    async fn resume_workload(
        &self,
        _host: &HostName,
        _workload: &WorkloadName,
    ) -> Result<(), OrchestratorError> {
        self.workload_resumes.fetch_add(1, Ordering::SeqCst);
        if self.fail_requests.load(Ordering::SeqCst)
            || self.fail_resumes.load(Ordering::SeqCst)
        {
            return Err(OrchestratorError::Transient(
                failover_client::Error::NoPeers,
            ));
        }
        Ok(())
    }
}
