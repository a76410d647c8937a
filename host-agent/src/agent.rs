// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-workload convergence loop.
//!
//! A [`WorkloadAgent`] drives one workload's actual state toward its desired
//! state, one `tick` at a time. Failures never escape a tick: they are
//! folded into the observed state and the tick's [`ConvergenceResult`], so
//! one broken workload cannot abort the scan of its siblings.

use crate::facilities::{
    ClusterController, ContainerStatus, HostFacilities, HostResources,
    WorkloadSource,
};
use chrono::{DateTime, Utc};
use node_repository_client::{
    HostName, ObservedStateReport, WorkloadName, WorkloadSpec,
};
use orchestrator_client::SuspensionDecision;
use slog::{Logger, debug, info, o, warn};
use std::sync::Arc;

/// Consecutive tick failures after which the workload is surfaced as
/// `Failed`. The agent keeps retrying regardless; this is for operator
/// visibility.
const FAILURE_THRESHOLD: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    Absent,
    Starting,
    Running,
    Converging,
    Removing,
    Failed,
}

/// Actual state of one workload as last converged by its agent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedState {
    pub container_exists: bool,
    pub container_running: bool,
    pub last_converged: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl ObservedState {
    fn to_report(&self) -> ObservedStateReport {
        ObservedStateReport {
            container_exists: self.container_exists,
            container_running: self.container_running,
            last_converged: self.last_converged,
            last_error: self.last_error.clone(),
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Outcome of one convergence attempt. Feeds logging and the supervisor's
/// success fraction; never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConvergenceResult {
    Converged,
    PartialFailure(String),
    /// Disruptive work was needed but no suspension has been granted;
    /// deferred to a later tick.
    Suspended,
}

/// Per-tick context handed down from the state updater.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickContext {
    /// Whether the host holds an orchestrator-granted suspension lease, so
    /// disruptive operations need no further permission.
    pub disruption_allowed: bool,
}

/// Collaborator handles shared by every agent on the host.
#[derive(Clone)]
pub struct AgentServices {
    pub facilities: Arc<dyn HostFacilities>,
    pub resources: HostResources,
    pub controller: Arc<dyn ClusterController>,
    pub repository: Arc<dyn WorkloadSource>,
}

pub struct WorkloadAgent {
    host: HostName,
    name: WorkloadName,
    /// `None` means the workload should no longer exist on this host; the
    /// agent then drives removal to completion.
    desired: Option<WorkloadSpec>,
    state: AgentState,
    observed: ObservedState,
    /// Runtime status from the most recent inspection, kept so the
    /// supervisor can detect image changes without another runtime call.
    last_status: Option<ContainerStatus>,
    resources_released: bool,
    /// Set while this agent holds a per-workload suspension from the
    /// orchestrator; it must be surrendered once disruption is over.
    suspension_held: bool,
    services: AgentServices,
    log: Logger,
}

impl WorkloadAgent {
    pub fn new(
        host: HostName,
        name: WorkloadName,
        desired: Option<WorkloadSpec>,
        services: AgentServices,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!("workload" => name.to_string()));
        Self {
            host,
            name,
            desired,
            state: AgentState::Absent,
            observed: ObservedState::default(),
            last_status: None,
            resources_released: true,
            suspension_held: false,
            services,
            log,
        }
    }

    pub fn name(&self) -> &WorkloadName {
        &self.name
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn observed(&self) -> &ObservedState {
        &self.observed
    }

    pub fn set_desired(&mut self, desired: Option<WorkloadSpec>) {
        self.desired = desired;
    }

    /// Whether the workload is gone for good: not wanted, container removed,
    /// resources reclaimed, no suspension still booked with the
    /// orchestrator. The supervisor drops agents in this state.
    pub fn is_torn_down(&self) -> bool {
        self.desired.is_none()
            && !self.observed.container_exists
            && self.resources_released
            && !self.suspension_held
            && self.state == AgentState::Absent
    }

    /// Whether converging to the desired state would require a disruptive
    /// operation (stopping a serving container).
    pub fn requires_disruption(&self) -> bool {
        self.would_require_disruption(self.desired.as_ref())
    }

    /// Like [`Self::requires_disruption`], but against a prospective
    /// desired state that has not been applied yet.
    pub fn would_require_disruption(
        &self,
        desired: Option<&WorkloadSpec>,
    ) -> bool {
        if !self.observed.container_running {
            return false;
        }
        match desired {
            None => true,
            Some(spec) => image_mismatch(spec, self.last_status.as_ref()),
        }
    }

    /// One convergence attempt. Never fails: every error is absorbed into
    /// the observed state and the returned result.
    pub async fn tick(&mut self, ctx: &TickContext) -> ConvergenceResult {
        let result = self.converge(ctx).await;
        // A converged workload needs no suspension any more; give it back
        // so the orchestrator returns the workload to traffic. On failure
        // the suspension is kept and the release retried next tick.
        if result == ConvergenceResult::Converged && self.suspension_held {
            self.release_suspension().await;
        }
        match &result {
            ConvergenceResult::Converged => {
                if self.observed.consecutive_failures >= FAILURE_THRESHOLD {
                    info!(self.log, "workload recovered");
                }
                self.observed.consecutive_failures = 0;
                self.observed.last_error = None;
                self.observed.last_converged = Some(Utc::now());
            }
            ConvergenceResult::Suspended => {
                // Not a failure: we are waiting on permission.
            }
            ConvergenceResult::PartialFailure(reason) => {
                self.observed.consecutive_failures += 1;
                self.observed.last_error = Some(reason.clone());
                if self.observed.consecutive_failures == FAILURE_THRESHOLD {
                    warn!(
                        self.log,
                        "workload keeps failing convergence, marking failed";
                        "consecutive_failures" =>
                            self.observed.consecutive_failures,
                        "last_error" => %reason,
                    );
                }
                if self.observed.consecutive_failures >= FAILURE_THRESHOLD {
                    self.state = AgentState::Failed;
                }
            }
        }
        self.report().await;
        result
    }

    async fn converge(&mut self, ctx: &TickContext) -> ConvergenceResult {
        let status =
            match self.services.facilities.inspect_container(&self.name).await
            {
                Ok(status) => status,
                Err(err) => {
                    return ConvergenceResult::PartialFailure(format!(
                        "inspecting container: {err:#}"
                    ));
                }
            };
        self.observed.container_exists = status.is_some();
        self.observed.container_running =
            status.as_ref().is_some_and(|s| s.running);
        self.last_status = status.clone();

        match (self.desired.clone(), status) {
            (None, None) => {
                if !self.resources_released {
                    if let Err(err) =
                        self.services.resources.release(&self.name).await
                    {
                        return ConvergenceResult::PartialFailure(format!(
                            "releasing host resources: {err:#}"
                        ));
                    }
                    self.resources_released = true;
                }
                self.state = AgentState::Absent;
                ConvergenceResult::Converged
            }
            (None, Some(status)) => self.remove(ctx, &status).await,
            (Some(spec), None) => self.provision(&spec).await,
            (Some(spec), Some(status)) => {
                if image_mismatch(&spec, Some(&status)) {
                    // Spec changes are applied by removal and recreation,
                    // never by mutating a live container.
                    match self.remove(ctx, &status).await {
                        ConvergenceResult::Converged => {
                            self.provision(&spec).await
                        }
                        deferred => deferred,
                    }
                } else if !status.running {
                    // A stopped container that should be running is
                    // recovery, not disruption.
                    self.state = AgentState::Starting;
                    if let Err(err) =
                        self.services.facilities.start_container(&spec).await
                    {
                        return ConvergenceResult::PartialFailure(format!(
                            "starting container: {err:#}"
                        ));
                    }
                    self.observed.container_running = true;
                    self.state = AgentState::Running;
                    ConvergenceResult::Converged
                } else {
                    self.state = AgentState::Running;
                    ConvergenceResult::Converged
                }
            }
        }
    }

    /// Stop and remove the container, then reclaim its host resources, in
    /// that order. Stopping a serving container requires either the
    /// host-wide lease or a per-workload suspension from the orchestrator.
    async fn remove(
        &mut self,
        ctx: &TickContext,
        status: &ContainerStatus,
    ) -> ConvergenceResult {
        if status.running {
            if !ctx.disruption_allowed {
                match self
                    .services
                    .controller
                    .request_workload_suspension(&self.host, &self.name)
                    .await
                {
                    Ok(SuspensionDecision::Allowed) => {
                        self.suspension_held = true;
                    }
                    Ok(SuspensionDecision::Denied { reason }) => {
                        info!(
                            self.log,
                            "workload suspension denied, deferring \
                             disruptive convergence";
                            "reason" => reason,
                        );
                        return ConvergenceResult::Suspended;
                    }
                    Err(err) => {
                        return ConvergenceResult::PartialFailure(format!(
                            "requesting workload suspension: {err}"
                        ));
                    }
                }
            }
            self.state = AgentState::Removing;
            if let Err(err) =
                self.services.facilities.stop_container(&self.name).await
            {
                return ConvergenceResult::PartialFailure(format!(
                    "stopping container: {err:#}"
                ));
            }
            self.observed.container_running = false;
        } else {
            self.state = AgentState::Removing;
        }

        if let Err(err) =
            self.services.facilities.remove_container(&self.name).await
        {
            return ConvergenceResult::PartialFailure(format!(
                "removing container: {err:#}"
            ));
        }
        self.observed.container_exists = false;
        self.last_status = None;

        // The container is gone; only now is it safe to reclaim its host
        // resources.
        if let Err(err) = self.services.resources.release(&self.name).await {
            return ConvergenceResult::PartialFailure(format!(
                "releasing host resources: {err:#}"
            ));
        }
        self.resources_released = true;

        self.state = if self.desired.is_some() {
            AgentState::Converging
        } else {
            AgentState::Absent
        };
        ConvergenceResult::Converged
    }

    async fn provision(&mut self, spec: &WorkloadSpec) -> ConvergenceResult {
        self.state = AgentState::Starting;
        if let Err(err) = self.services.resources.configure(spec).await {
            return ConvergenceResult::PartialFailure(format!(
                "configuring host resources: {err:#}"
            ));
        }
        self.resources_released = false;

        if let Err(err) =
            self.services.facilities.start_container(spec).await
        {
            return ConvergenceResult::PartialFailure(format!(
                "starting container: {err:#}"
            ));
        }
        self.observed.container_exists = true;
        self.observed.container_running = true;
        self.last_status = Some(ContainerStatus {
            running: true,
            image: spec.wanted_image.clone(),
        });
        self.state = AgentState::Running;
        ConvergenceResult::Converged
    }

    async fn release_suspension(&mut self) {
        match self
            .services
            .controller
            .resume_workload(&self.host, &self.name)
            .await
        {
            Ok(()) => {
                self.suspension_held = false;
            }
            Err(err) => {
                warn!(
                    self.log,
                    "failed to release workload suspension, will retry \
                     next tick";
                    "err" => %err,
                );
            }
        }
    }

    /// Best-effort report of the observed state back to the node
    /// repository; a failed report is retried by the next tick's report.
    async fn report(&self) {
        let report = self.observed.to_report();
        if let Err(err) = self
            .services
            .repository
            .report_observed_state(&self.name, &report)
            .await
        {
            debug!(
                self.log,
                "failed to report observed state, will retry next tick";
                "err" => %err,
            );
        }
    }
}

fn image_mismatch(
    spec: &WorkloadSpec,
    status: Option<&ContainerStatus>,
) -> bool {
    match (&spec.wanted_image, status) {
        (Some(wanted), Some(status)) => {
            status.image.as_ref() != Some(wanted)
        }
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::{FakeController, FakeRepository, test_logger};
    use crate::sim::{SimEvent, SimFacilities};
    use node_repository_client::WorkloadState;
    use std::str::FromStr;

    fn spec(name: &str, image: &str) -> WorkloadSpec {
        WorkloadSpec {
            name: WorkloadName::from_str(name).unwrap(),
            state: WorkloadState::Active,
            tenant: Some("tenant1".to_string()),
            wanted_image: Some(image.to_string()),
            min_cpu_cores: 2.0,
            min_main_memory_gb: 8.0,
            min_disk_gb: 100.0,
            ip_addresses: Vec::new(),
        }
    }

    struct Harness {
        sim: Arc<SimFacilities>,
        controller: Arc<FakeController>,
        repository: Arc<FakeRepository>,
        agent: WorkloadAgent,
    }

    fn harness(name: &str, desired: Option<WorkloadSpec>) -> Harness {
        let log = test_logger();
        let sim = Arc::new(SimFacilities::new());
        let controller = Arc::new(FakeController::new());
        let repository = Arc::new(FakeRepository::new());
        let services = AgentServices {
            facilities: sim.clone(),
            resources: HostResources::new(sim.clone(), &log),
            controller: controller.clone(),
            repository: repository.clone(),
        };
        let agent = WorkloadAgent::new(
            HostName::from_str("host1.example.com").unwrap(),
            WorkloadName::from_str(name).unwrap(),
            desired,
            services,
            &log,
        );
        Harness { sim, controller, repository, agent }
    }

    #[tokio::test]
    async fn provisions_missing_workload() {
        let mut h = harness("w1", Some(spec("w1", "app:1")));
        let result = h.agent.tick(&TickContext::default()).await;
        assert_eq!(result, ConvergenceResult::Converged);
        assert_eq!(h.agent.state(), AgentState::Running);
        assert_eq!(
            h.sim.take_events(),
            vec![
                SimEvent::ConfigureResources("w1".to_string()),
                SimEvent::Start("w1".to_string()),
            ]
        );
        // Observed state was reported upstream.
        let report = h.repository.last_report("w1").unwrap();
        assert!(report.container_running);
    }

    #[tokio::test]
    async fn running_workload_is_left_alone() {
        let mut h = harness("w1", Some(spec("w1", "app:1")));
        h.agent.tick(&TickContext::default()).await;
        h.sim.take_events();

        let result = h.agent.tick(&TickContext::default()).await;
        assert_eq!(result, ConvergenceResult::Converged);
        // No runtime mutations on an already-converged workload.
        assert_eq!(h.sim.take_events(), Vec::new());
    }

    #[tokio::test]
    async fn removal_is_deferred_while_suspension_denied() {
        let mut h = harness("w1", Some(spec("w1", "app:1")));
        h.agent.tick(&TickContext::default()).await;
        h.sim.take_events();

        h.controller.deny_all("redundancy too low");
        h.agent.set_desired(None);
        let result = h.agent.tick(&TickContext::default()).await;
        assert_eq!(result, ConvergenceResult::Suspended);
        // The container was not touched.
        assert_eq!(h.sim.take_events(), Vec::new());
        assert!(h.agent.observed().container_running);

        // Once the orchestrator allows it, removal proceeds in order: stop,
        // remove, release resources.
        h.controller.allow_all();
        let result = h.agent.tick(&TickContext::default()).await;
        assert_eq!(result, ConvergenceResult::Converged);
        assert_eq!(
            h.sim.take_events(),
            vec![
                SimEvent::Stop("w1".to_string()),
                SimEvent::Remove("w1".to_string()),
                SimEvent::ReleaseResources("w1".to_string()),
            ]
        );
        assert!(h.agent.is_torn_down());
        // The granted suspension was handed back once teardown finished.
        assert_eq!(h.controller.workload_resume_calls(), 1);
    }

    #[tokio::test]
    async fn host_lease_bypasses_workload_suspension() {
        let mut h = harness("w1", Some(spec("w1", "app:1")));
        h.agent.tick(&TickContext::default()).await;

        h.controller.deny_all("should not be asked");
        h.agent.set_desired(None);
        let ctx = TickContext { disruption_allowed: true };
        let result = h.agent.tick(&ctx).await;
        assert_eq!(result, ConvergenceResult::Converged);
        assert_eq!(h.controller.workload_suspension_requests(), 0);
    }

    #[tokio::test]
    async fn image_change_replaces_container() {
        let mut h = harness("w1", Some(spec("w1", "app:1")));
        h.agent.tick(&TickContext::default()).await;
        h.sim.take_events();

        h.agent.set_desired(Some(spec("w1", "app:2")));
        assert!(h.agent.requires_disruption());
        let ctx = TickContext { disruption_allowed: true };
        let result = h.agent.tick(&ctx).await;
        assert_eq!(result, ConvergenceResult::Converged);
        assert_eq!(
            h.sim.take_events(),
            vec![
                SimEvent::Stop("w1".to_string()),
                SimEvent::Remove("w1".to_string()),
                SimEvent::ReleaseResources("w1".to_string()),
                SimEvent::ConfigureResources("w1".to_string()),
                SimEvent::Start("w1".to_string()),
            ]
        );
        assert_eq!(h.agent.state(), AgentState::Running);
        assert_eq!(
            h.sim.container("w1").unwrap().image.as_deref(),
            Some("app:2")
        );
    }

    #[tokio::test]
    async fn replacement_suspension_is_released_after_convergence() {
        let mut h = harness("w1", Some(spec("w1", "app:1")));
        h.agent.tick(&TickContext::default()).await;

        // Replace without a host-wide lease: the per-workload suspension
        // is granted, used, and surrendered within the same tick, so the
        // orchestrator never keeps a serving workload booked as down.
        h.agent.set_desired(Some(spec("w1", "app:2")));
        let result = h.agent.tick(&TickContext::default()).await;
        assert_eq!(result, ConvergenceResult::Converged);
        assert_eq!(
            h.sim.container("w1").unwrap().image.as_deref(),
            Some("app:2")
        );
        assert_eq!(h.controller.workload_suspension_requests(), 1);
        assert_eq!(h.controller.workload_resume_calls(), 1);
    }

    #[tokio::test]
    async fn suspension_release_failure_is_retried() {
        let mut h = harness("w1", Some(spec("w1", "app:1")));
        h.agent.tick(&TickContext::default()).await;

        h.controller.fail_resumes();
        h.agent.set_desired(Some(spec("w1", "app:2")));
        h.agent.tick(&TickContext::default()).await;
        // The replacement landed but the release failed; the suspension
        // stays booked and the agent is not considered done.
        assert_eq!(h.controller.workload_resume_calls(), 1);

        h.controller.restore_resumes();
        let result = h.agent.tick(&TickContext::default()).await;
        assert_eq!(result, ConvergenceResult::Converged);
        assert_eq!(h.controller.workload_resume_calls(), 2);
        // The retry releases the suspension we already hold; it does not
        // request a new one.
        assert_eq!(h.controller.workload_suspension_requests(), 1);
    }

    #[tokio::test]
    async fn image_change_without_permission_touches_nothing() {
        let mut h = harness("w1", Some(spec("w1", "app:1")));
        h.agent.tick(&TickContext::default()).await;
        h.sim.take_events();

        h.controller.deny_all("redundancy too low");
        h.agent.set_desired(Some(spec("w1", "app:2")));
        let result = h.agent.tick(&TickContext::default()).await;
        assert_eq!(result, ConvergenceResult::Suspended);
        assert_eq!(h.sim.take_events(), Vec::new());
        assert_eq!(
            h.sim.container("w1").unwrap().image.as_deref(),
            Some("app:1")
        );
    }

    #[tokio::test]
    async fn repeated_failures_mark_workload_failed_then_recover() {
        let mut h = harness("w1", Some(spec("w1", "app:1")));
        h.sim.fail_start("w1");

        for i in 1..=FAILURE_THRESHOLD {
            let result = h.agent.tick(&TickContext::default()).await;
            assert!(matches!(
                result,
                ConvergenceResult::PartialFailure(_)
            ));
            assert_eq!(h.agent.observed().consecutive_failures, i);
        }
        assert_eq!(h.agent.state(), AgentState::Failed);
        assert!(h.agent.observed().last_error.is_some());

        // The agent never gives up: once the runtime recovers, so does the
        // workload.
        h.sim.clear_failures();
        let result = h.agent.tick(&TickContext::default()).await;
        assert_eq!(result, ConvergenceResult::Converged);
        assert_eq!(h.agent.state(), AgentState::Running);
        assert_eq!(h.agent.observed().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn report_failure_does_not_fail_the_tick() {
        let mut h = harness("w1", Some(spec("w1", "app:1")));
        h.repository.fail_reports();
        let result = h.agent.tick(&TickContext::default()).await;
        assert_eq!(result, ConvergenceResult::Converged);
    }

    #[tokio::test]
    async fn stopped_container_is_restarted_without_permission() {
        let mut h = harness("w1", Some(spec("w1", "app:1")));
        h.agent.tick(&TickContext::default()).await;
        h.sim.stop_container_out_of_band("w1");
        h.sim.take_events();

        h.controller.deny_all("should not be asked");
        let result = h.agent.tick(&TickContext::default()).await;
        assert_eq!(result, ConvergenceResult::Converged);
        assert_eq!(
            h.sim.take_events(),
            vec![SimEvent::Start("w1".to_string())]
        );
        assert_eq!(h.controller.workload_suspension_requests(), 0);
    }
}
