// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-host convergence agent.
//!
//! The agent continuously reconciles the workloads that *should* run on this
//! host (declared by the node repository) against what *actually* runs,
//! coordinating disruptive operations with the cluster orchestrator. The
//! pieces, bottom up:
//!
//! - [`agent::WorkloadAgent`]: per-workload convergence state machine;
//! - [`supervisor::AgentSupervisor`]: owns the set of live agents and runs
//!   their ticks concurrently;
//! - [`updater::StateUpdater`]: the top-level loop, including host-wide
//!   suspend/resume and the single-instance host lock.

pub mod agent;
pub mod config;
pub mod facilities;
pub mod host_lock;
pub mod sim;
pub mod supervisor;
pub mod updater;

#[cfg(test)]
pub(crate) mod fakes;
