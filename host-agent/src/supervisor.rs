// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet of per-workload agents on one host.
//!
//! The supervisor owns one [`WorkloadAgent`] per workload assigned to the
//! host, keeps that set in sync with the desired state handed down by the
//! updater, and runs a tick across all agents with bounded parallelism.

use crate::agent::{
    AgentServices, ConvergenceResult, TickContext, WorkloadAgent,
};
use node_repository_client::{
    HostName, WorkloadName, WorkloadSpec, WorkloadState,
};
use slog::{Logger, error, info, o, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

/// Per-workload outcomes of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub results: BTreeMap<WorkloadName, ConvergenceResult>,
}

impl ReconcileSummary {
    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    pub fn converged(&self) -> usize {
        self.results
            .values()
            .filter(|r| **r == ConvergenceResult::Converged)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .values()
            .filter(|r| matches!(r, ConvergenceResult::PartialFailure(_)))
            .count()
    }

    /// Whether any workload is waiting on a suspension before it can
    /// finish converging.
    pub fn disruption_pending(&self) -> bool {
        self.results
            .values()
            .any(|r| *r == ConvergenceResult::Suspended)
    }

    /// Fraction of workloads whose tick did not fail. Deferred disruptive
    /// work counts as success; it is pending, not broken.
    pub fn success_fraction(&self) -> f64 {
        if self.results.is_empty() {
            1.0
        } else {
            (self.attempted() - self.failed()) as f64
                / self.attempted() as f64
        }
    }
}

pub struct AgentSupervisor {
    host: HostName,
    agents: BTreeMap<WorkloadName, Arc<Mutex<WorkloadAgent>>>,
    services: AgentServices,
    tick_semaphore: Arc<Semaphore>,
    log: Logger,
}

impl AgentSupervisor {
    pub fn new(
        host: HostName,
        services: AgentServices,
        max_parallelism: usize,
        log: &Logger,
    ) -> Self {
        Self {
            host,
            agents: BTreeMap::new(),
            services,
            tick_semaphore: Arc::new(Semaphore::new(max_parallelism)),
            log: log.new(o!("component" => "AgentSupervisor")),
        }
    }

    pub fn workload_count(&self) -> usize {
        self.agents.len()
    }

    /// Whether applying `desired` would require any disruptive operation.
    /// The updater uses this to decide whether to ask the orchestrator for
    /// a host-wide suspension up front.
    pub async fn pending_disruption(
        &self,
        desired: &[WorkloadSpec],
    ) -> bool {
        for (name, agent) in &self.agents {
            let spec = desired
                .iter()
                .find(|s| &s.name == name && s.state.requires_container());
            if agent.lock().await.would_require_disruption(spec) {
                return true;
            }
        }
        false
    }

    /// One reconciliation pass: sync the agent set to `desired`, tick every
    /// agent, and drop agents whose workloads are fully torn down.
    pub async fn reconcile(
        &mut self,
        desired: Vec<WorkloadSpec>,
        ctx: TickContext,
    ) -> ReconcileSummary {
        let dirty: Vec<WorkloadName> = desired
            .iter()
            .filter(|spec| spec.state == WorkloadState::Dirty)
            .map(|spec| spec.name.clone())
            .collect();
        let wanted: BTreeMap<WorkloadName, WorkloadSpec> = desired
            .into_iter()
            .filter(|spec| spec.state.requires_container())
            .map(|spec| (spec.name.clone(), spec))
            .collect();

        for (name, spec) in &wanted {
            match self.agents.get(name) {
                Some(agent) => {
                    agent.lock().await.set_desired(Some(spec.clone()));
                }
                None => {
                    info!(
                        self.log, "workload assigned to this host";
                        "workload" => %name,
                    );
                    let agent = WorkloadAgent::new(
                        self.host.clone(),
                        name.clone(),
                        Some(spec.clone()),
                        self.services.clone(),
                        &self.log,
                    );
                    self.agents
                        .insert(name.clone(), Arc::new(Mutex::new(agent)));
                }
            }
        }
        for (name, agent) in &self.agents {
            if !wanted.contains_key(name) {
                agent.lock().await.set_desired(None);
            }
        }

        // Containers nobody asked for, e.g. left behind by a previous
        // agent process, get a removal-driving agent of their own.
        match self.services.facilities.list_containers().await {
            Ok(names) => {
                for name in names {
                    if self.agents.contains_key(&name) {
                        continue;
                    }
                    info!(
                        self.log,
                        "found container with no assigned workload, \
                         scheduling removal";
                        "workload" => %name,
                    );
                    let agent = WorkloadAgent::new(
                        self.host.clone(),
                        name.clone(),
                        None,
                        self.services.clone(),
                        &self.log,
                    );
                    self.agents
                        .insert(name, Arc::new(Mutex::new(agent)));
                }
            }
            Err(err) => {
                warn!(
                    self.log, "failed to list containers";
                    "err" => %err,
                );
            }
        }

        let mut ticks = JoinSet::new();
        for (name, agent) in &self.agents {
            let name = name.clone();
            let agent = Arc::clone(agent);
            let semaphore = Arc::clone(&self.tick_semaphore);
            ticks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("we never close the semaphore");
                let result = agent.lock().await.tick(&ctx).await;
                (name, result)
            });
        }

        let mut summary = ReconcileSummary::default();
        while let Some(joined) = ticks.join_next().await {
            match joined {
                Ok((name, result)) => {
                    summary.results.insert(name, result);
                }
                Err(err) => {
                    error!(
                        self.log, "workload tick panicked";
                        "err" => %err,
                    );
                }
            }
        }

        let mut torn_down = Vec::new();
        for (name, agent) in &self.agents {
            if agent.lock().await.is_torn_down() {
                torn_down.push(name.clone());
            }
        }
        for name in torn_down {
            info!(
                self.log, "workload fully removed from this host";
                "workload" => %name,
            );
            self.agents.remove(&name);
        }

        // Dirty workloads with nothing left on the host have finished
        // cleanup; tell the repository so the node can be reallocated. On
        // failure the workload is still listed dirty next tick and the
        // update is retried.
        for name in dirty {
            if self.agents.contains_key(&name) {
                continue;
            }
            match self
                .services
                .repository
                .set_workload_state(&name, WorkloadState::Ready)
                .await
            {
                Ok(()) => {
                    info!(
                        self.log,
                        "workload cleanup complete, marked ready for \
                         reallocation";
                        "workload" => %name,
                    );
                }
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to mark workload ready, will retry next \
                         tick";
                        "workload" => %name,
                        "err" => %err,
                    );
                }
            }
        }

        summary
    }
}
