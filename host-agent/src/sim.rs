// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory container runtime.
//!
//! Backs the `host-agent` binary when no real runtime is wired up yet, and
//! the convergence tests, which assert on the exact sequence of runtime
//! operations via [`SimFacilities::take_events`].

use crate::facilities::{ContainerStatus, HostFacilities};
use anyhow::bail;
use async_trait::async_trait;
use node_repository_client::{WorkloadName, WorkloadSpec};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// One mutation applied to the simulated runtime, in application order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    Start(String),
    Stop(String),
    Remove(String),
    ConfigureResources(String),
    ReleaseResources(String),
}

#[derive(Default)]
struct SimState {
    containers: BTreeMap<String, ContainerStatus>,
    events: Vec<SimEvent>,
    fail_start: BTreeSet<String>,
    fail_stop: BTreeSet<String>,
    fail_configure: BTreeSet<String>,
}

#[derive(Default)]
pub struct SimFacilities {
    state: Mutex<SimState>,
}

impl SimFacilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn container(&self, workload: &str) -> Option<ContainerStatus> {
        self.state.lock().unwrap().containers.get(workload).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    /// Drain and return all mutations recorded since the last call.
    pub fn take_events(&self) -> Vec<SimEvent> {
        std::mem::take(&mut self.state.lock().unwrap().events)
    }

    /// Seed a container that exists before the agent's first tick, as if
    /// left behind by a previous process.
    pub fn insert_container(&self, workload: &str, status: ContainerStatus) {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(workload.to_string(), status);
    }

    /// Stop a container behind the agent's back.
    pub fn stop_container_out_of_band(&self, workload: &str) {
        if let Some(status) =
            self.state.lock().unwrap().containers.get_mut(workload)
        {
            status.running = false;
        }
    }

    pub fn fail_start(&self, workload: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_start
            .insert(workload.to_string());
    }

    pub fn fail_stop(&self, workload: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_stop
            .insert(workload.to_string());
    }

    pub fn fail_configure(&self, workload: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_configure
            .insert(workload.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_start.clear();
        state.fail_stop.clear();
        state.fail_configure.clear();
    }
}

#[async_trait]
impl HostFacilities for SimFacilities {
    async fn list_containers(
        &self,
    ) -> anyhow::Result<Vec<WorkloadName>> {
        // Container names that don't fit the workload naming scheme were
        // not created by an agent and are left alone.
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .keys()
            .filter_map(|name| name.parse().ok())
            .collect())
    }

    async fn inspect_container(
        &self,
        workload: &WorkloadName,
    ) -> anyhow::Result<Option<ContainerStatus>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .get(workload.as_str())
            .cloned())
    }

    async fn start_container(
        &self,
        spec: &WorkloadSpec,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = spec.name.as_str();
        if state.fail_start.contains(name) {
            bail!("simulated failure starting container {name}");
        }
        state.containers.insert(
            name.to_string(),
            ContainerStatus {
                running: true,
                image: spec.wanted_image.clone(),
            },
        );
        state.events.push(SimEvent::Start(name.to_string()));
        Ok(())
    }

    async fn stop_container(
        &self,
        workload: &WorkloadName,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = workload.as_str();
        if state.fail_stop.contains(name) {
            bail!("simulated failure stopping container {name}");
        }
        if let Some(status) = state.containers.get_mut(name) {
            status.running = false;
        }
        state.events.push(SimEvent::Stop(name.to_string()));
        Ok(())
    }

    async fn remove_container(
        &self,
        workload: &WorkloadName,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = workload.as_str();
        state.containers.remove(name);
        state.events.push(SimEvent::Remove(name.to_string()));
        Ok(())
    }

    async fn configure_host_resources(
        &self,
        spec: &WorkloadSpec,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = spec.name.as_str();
        if state.fail_configure.contains(name) {
            bail!("simulated failure configuring resources for {name}");
        }
        state.events.push(SimEvent::ConfigureResources(name.to_string()));
        Ok(())
    }

    async fn release_host_resources(
        &self,
        workload: &WorkloadName,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .events
            .push(SimEvent::ReleaseResources(workload.as_str().to_string()));
        Ok(())
    }
}
