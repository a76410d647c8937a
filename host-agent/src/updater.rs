// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-level convergence loop and suspension arbitration.
//!
//! The [`StateUpdater`] periodically fetches the host's desired workloads
//! from the node repository and hands them to the supervisor. When a pass
//! would require disruptive work, it first asks the orchestrator for a
//! host-wide suspension; the resulting lease is surrendered once the host
//! has converged. A watch channel publishes the updater's status for the
//! binary and for tests.

use crate::agent::TickContext;
use crate::facilities::{ClusterController, WorkloadSource};
use crate::host_lock::HostLock;
use crate::supervisor::AgentSupervisor;
use chrono::{DateTime, Utc};
use node_repository_client::{HostName, WorkloadSpec};
use orchestrator_client::SuspensionDecision;
use slog::{Logger, info, o, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdaterState {
    /// Normal operation: only non-disruptive convergence is allowed.
    Resumed,
    /// The orchestrator has granted this host a suspension lease;
    /// disruptive operations may proceed.
    Suspended,
}

/// Proof of an orchestrator-granted host suspension.
#[derive(Clone, Debug)]
pub struct SuspensionLease {
    pub owner: HostName,
    pub acquired_at: DateTime<Utc>,
}

/// Snapshot of the updater published after every tick.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdaterStatus {
    pub state: UpdaterState,
    pub ticks_completed: u64,
    pub last_success_fraction: f64,
    /// Set when the last tick converged against a cached desired state
    /// because the node repository was unreachable.
    pub degraded: bool,
}

pub struct StateUpdater {
    host: HostName,
    // Held for the lifetime of the updater; released on drop.
    _lock: HostLock,
    repository: Arc<dyn WorkloadSource>,
    controller: Arc<dyn ClusterController>,
    supervisor: AgentSupervisor,
    state: UpdaterState,
    lease: Option<SuspensionLease>,
    last_known_desired: Vec<WorkloadSpec>,
    suspend_timeout: Duration,
    status_tx: watch::Sender<UpdaterStatus>,
    log: Logger,
}

impl StateUpdater {
    pub fn new(
        host: HostName,
        lock: HostLock,
        repository: Arc<dyn WorkloadSource>,
        controller: Arc<dyn ClusterController>,
        supervisor: AgentSupervisor,
        suspend_timeout: Duration,
        log: &Logger,
    ) -> (Self, watch::Receiver<UpdaterStatus>) {
        let (status_tx, status_rx) = watch::channel(UpdaterStatus {
            state: UpdaterState::Resumed,
            ticks_completed: 0,
            last_success_fraction: 1.0,
            degraded: false,
        });
        let updater = Self {
            host,
            _lock: lock,
            repository,
            controller,
            supervisor,
            state: UpdaterState::Resumed,
            lease: None,
            last_known_desired: Vec::new(),
            suspend_timeout,
            status_tx,
            log: log.new(o!("component" => "StateUpdater")),
        };
        (updater, status_rx)
    }

    pub fn state(&self) -> UpdaterState {
        self.state
    }

    pub fn lease(&self) -> Option<&SuspensionLease> {
        self.lease.as_ref()
    }

    /// Run ticks at `interval` until `shutdown` flips to true or its sender
    /// goes away, then resume the host if we still hold a lease.
    pub async fn run(
        mut self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// One host-level pass: fetch desired state, arbitrate suspension,
    /// reconcile, publish status.
    pub async fn tick(&mut self) {
        let mut degraded = false;
        let desired = match self.repository.list_workloads(&self.host).await
        {
            Ok(desired) => {
                self.last_known_desired = desired.clone();
                desired
            }
            Err(err) => {
                // Keep converging against the last known desired state so
                // a config server outage does not stall local recovery.
                warn!(
                    self.log,
                    "failed to fetch desired state, converging against \
                     last known";
                    "err" => %err,
                );
                degraded = true;
                self.last_known_desired.clone()
            }
        };

        if self.state == UpdaterState::Resumed
            && self.supervisor.pending_disruption(&desired).await
        {
            self.try_suspend().await;
        }

        let ctx = TickContext {
            disruption_allowed: self.state == UpdaterState::Suspended,
        };
        let summary = self.supervisor.reconcile(desired.clone(), ctx).await;
        if summary.success_fraction() < 1.0 {
            warn!(
                self.log, "reconciliation only partially succeeded";
                "converged" => summary.converged(),
                "attempted" => summary.attempted(),
            );
        }

        // Surrender the lease as soon as no disruptive work remains, so
        // the orchestrator can let traffic back in.
        if self.state == UpdaterState::Suspended
            && !self.supervisor.pending_disruption(&desired).await
        {
            self.try_resume().await;
        }

        self.status_tx.send_modify(|status| {
            status.state = self.state;
            status.ticks_completed += 1;
            status.last_success_fraction = summary.success_fraction();
            status.degraded = degraded;
        });
    }

    async fn try_suspend(&mut self) {
        let request = self.controller.request_host_suspension(&self.host);
        match tokio::time::timeout(self.suspend_timeout, request).await {
            Ok(Ok(SuspensionDecision::Allowed)) => {
                info!(self.log, "host suspension granted");
                self.state = UpdaterState::Suspended;
                self.lease = Some(SuspensionLease {
                    owner: self.host.clone(),
                    acquired_at: Utc::now(),
                });
            }
            Ok(Ok(SuspensionDecision::Denied { reason })) => {
                info!(
                    self.log,
                    "host suspension denied, converging non-disruptively";
                    "reason" => reason,
                );
            }
            Ok(Err(err)) => {
                warn!(
                    self.log, "host suspension request failed";
                    "err" => %err,
                );
            }
            Err(_) => {
                warn!(
                    self.log, "host suspension request timed out";
                    "timeout" => ?self.suspend_timeout,
                );
            }
        }
    }

    async fn try_resume(&mut self) {
        match self.controller.resume_host(&self.host).await {
            Ok(()) => {
                info!(self.log, "host resumed");
                self.state = UpdaterState::Resumed;
                self.lease = None;
            }
            Err(err) => {
                // Stay suspended; resuming without the orchestrator's
                // acknowledgement would leave its bookkeeping stale.
                warn!(
                    self.log, "failed to resume host, will retry";
                    "err" => %err,
                );
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.state == UpdaterState::Suspended {
            self.try_resume().await;
        }
        info!(self.log, "state updater stopped");
    }
}
