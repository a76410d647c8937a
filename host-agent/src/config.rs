// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent configuration, read once at startup from a TOML file.

use camino::{Utf8Path, Utf8PathBuf};
use failover_client::{FailoverConfig, TlsConfig};
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Hostname this agent manages; must match the node repository's view.
    pub hostname: String,

    pub config_servers: ConfigServerConfig,

    /// Seconds between convergence passes of the state updater.
    #[serde(default = "defaults::converge_interval_secs")]
    pub converge_interval_secs: u64,

    /// Bound on how long a tick waits for the orchestrator to arbitrate a
    /// host suspension before degrading to non-disruptive convergence.
    #[serde(default = "defaults::suspend_timeout_secs")]
    pub suspend_timeout_secs: u64,

    /// Maximum number of workload agents ticking at once.
    #[serde(default = "defaults::max_parallel_ticks")]
    pub max_parallel_ticks: usize,

    /// Lock file guaranteeing a single agent instance per host.
    #[serde(default = "defaults::lock_path")]
    pub lock_path: Utf8PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConfigServerConfig {
    #[serde(default = "defaults::scheme")]
    pub scheme: String,
    pub hosts: Vec<String>,
    pub port: u16,

    /// Client certificate and key, as one PEM bundle.
    pub identity_pem: Option<Utf8PathBuf>,
    /// Trust root for the config servers.
    pub ca_pem: Option<Utf8PathBuf>,

    #[serde(default = "defaults::tls_refresh_interval_secs")]
    pub tls_refresh_interval_secs: u64,
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,
}

mod defaults {
    use camino::Utf8PathBuf;

    pub(super) fn converge_interval_secs() -> u64 {
        30
    }
    pub(super) fn suspend_timeout_secs() -> u64 {
        10
    }
    pub(super) fn max_parallel_ticks() -> usize {
        16
    }
    pub(super) fn lock_path() -> Utf8PathBuf {
        Utf8PathBuf::from("/var/run/host-agent.lock")
    }
    pub(super) fn scheme() -> String {
        "https".to_string()
    }
    pub(super) fn tls_refresh_interval_secs() -> u64 {
        3600
    }
    pub(super) fn request_timeout_secs() -> u64 {
        30
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

impl Config {
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }

    pub fn converge_interval(&self) -> Duration {
        Duration::from_secs(self.converge_interval_secs)
    }

    pub fn suspend_timeout(&self) -> Duration {
        Duration::from_secs(self.suspend_timeout_secs)
    }

    /// The transport configuration for the config server fleet.
    pub fn failover_config(&self) -> FailoverConfig {
        let servers = &self.config_servers;
        let tls = if servers.identity_pem.is_some()
            || servers.ca_pem.is_some()
        {
            Some(TlsConfig {
                identity_pem: servers.identity_pem.clone(),
                ca_pem: servers.ca_pem.clone(),
            })
        } else {
            None
        };
        FailoverConfig {
            peers: servers
                .hosts
                .iter()
                .map(|host| {
                    format!("{}://{}:{}", servers.scheme, host, servers.port)
                })
                .collect(),
            tls,
            request_timeout: Duration::from_secs(
                servers.request_timeout_secs,
            ),
            tls_refresh_interval: Duration::from_secs(
                servers.tls_refresh_interval_secs,
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            hostname = "host7.example.com"

            [config_servers]
            hosts = ["cfg1.example.com", "cfg2.example.com"]
            port = 4443
            "#,
        )
        .unwrap();

        assert_eq!(config.hostname, "host7.example.com");
        assert_eq!(config.converge_interval_secs, 30);
        assert_eq!(config.max_parallel_ticks, 16);

        let failover = config.failover_config();
        assert_eq!(
            failover.peers,
            vec![
                "https://cfg1.example.com:4443".to_string(),
                "https://cfg2.example.com:4443".to_string(),
            ]
        );
        assert!(failover.tls.is_none());
    }

    #[test]
    fn tls_paths_enable_tls() {
        let config: Config = toml::from_str(
            r#"
            hostname = "host7.example.com"

            [config_servers]
            scheme = "https"
            hosts = ["cfg1.example.com"]
            port = 4443
            identity_pem = "/etc/host-agent/identity.pem"
            ca_pem = "/etc/host-agent/ca.pem"
            "#,
        )
        .unwrap();

        let tls = config.failover_config().tls.unwrap();
        assert_eq!(
            tls.identity_pem.as_deref(),
            Some(Utf8Path::new("/etc/host-agent/identity.pem"))
        );
    }

    #[test]
    fn missing_hosts_is_a_parse_error() {
        let err = toml::from_str::<Config>(
            r#"
            hostname = "host7.example.com"
            [config_servers]
            port = 4443
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("hosts"));
    }
}
