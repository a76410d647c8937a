// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that runs the host agent against a config server fleet.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use failover_client::FailoverClient;
use host_agent::agent::AgentServices;
use host_agent::config::Config;
use host_agent::facilities::HostResources;
use host_agent::host_lock::HostLock;
use host_agent::sim::SimFacilities;
use host_agent::supervisor::AgentSupervisor;
use host_agent::updater::StateUpdater;
use node_repository_client::{HostName, NodeRepositoryClient};
use orchestrator_client::OrchestratorClient;
use slog::{Drain, Logger, info, o};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Parser)]
#[command(name = "host-agent", about = "Per-host workload agent")]
struct Args {
    /// Path to the agent's TOML config file.
    #[arg(long)]
    config: Utf8PathBuf,
}

fn root_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("name" => "host-agent"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)?;
    let log = root_logger();

    // Fail fast if another agent instance already manages this host.
    let lock = HostLock::try_acquire(&config.lock_path)
        .with_context(|| format!("acquiring {}", config.lock_path))?;

    let host = HostName::from_str(&config.hostname)?;
    info!(
        log, "host agent starting";
        "hostname" => %host,
        "config_servers" => config.config_servers.hosts.len(),
    );

    let transport =
        Arc::new(FailoverClient::new(config.failover_config(), &log)?);
    let repository =
        Arc::new(NodeRepositoryClient::new(transport.clone(), &log));
    let orchestrator = Arc::new(OrchestratorClient::new(transport, &log));

    // The container runtime binding lives outside this crate; until one is
    // wired up the agent runs against the in-memory runtime.
    let facilities = Arc::new(SimFacilities::new());
    let services = AgentServices {
        facilities: facilities.clone(),
        resources: HostResources::new(facilities, &log),
        controller: orchestrator.clone(),
        repository: repository.clone(),
    };
    let supervisor = AgentSupervisor::new(
        host.clone(),
        services,
        config.max_parallel_ticks,
        &log,
    );
    let (updater, _status_rx) = StateUpdater::new(
        host,
        lock,
        repository,
        orchestrator,
        supervisor,
        config.suspend_timeout(),
        &log,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let updater_task =
        tokio::spawn(updater.run(config.converge_interval(), shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!(log, "shutdown signal received");
    shutdown_tx.send(true).ok();
    updater_task.await.context("joining state updater")?;
    Ok(())
}
