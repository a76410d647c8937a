// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for a replicated set of config servers.
//!
//! Requests are retried against each peer in turn until one answers; peers
//! being down or mid-upgrade is a normal condition, not an error. The
//! underlying [`reqwest::Client`] is rebuilt on a timer so that rotated TLS
//! material is picked up without restarting the process, and the replacement
//! is published through a watch channel so in-flight calls keep using the
//! client they started with.

use camino::Utf8PathBuf;
use rand::seq::SliceRandom;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use slog::{Logger, debug, info, o, warn};
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

pub use reqwest::Method;

/// How long we wait for a TCP connection to a single peer. Kept short so a
/// dead peer costs little before we move to the next one.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no config server peers configured")]
    NoPeers,

    #[error("invalid peer URI {uri:?}")]
    InvalidPeerUri {
        uri: String,
        #[source]
        err: url::ParseError,
    },

    #[error("invalid request path {path:?}")]
    InvalidPath {
        path: String,
        #[source]
        err: url::ParseError,
    },

    #[error("failed to read TLS material from {path}")]
    TlsMaterialIo {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("invalid TLS material in {path}")]
    InvalidTlsMaterial {
        path: Utf8PathBuf,
        #[source]
        err: reqwest::Error,
    },

    #[error("failed to build HTTP client")]
    BuildClient(#[source] reqwest::Error),

    #[error("failed to communicate with {peer}")]
    Unreachable {
        peer: Url,
        #[source]
        err: reqwest::Error,
    },

    #[error("{peer} returned status {status}: {message}")]
    Status { peer: Url, status: StatusCode, message: String },

    #[error("failed to deserialize response from {peer}")]
    Deserialize {
        peer: Url,
        #[source]
        err: reqwest::Error,
    },

    #[error("all config servers unreachable, last error follows")]
    AllPeersUnreachable(#[source] Box<Error>),
}

impl Error {
    /// The HTTP status this error carries, if the request made it far enough
    /// to get one. Looks through [`Error::AllPeersUnreachable`] at the last
    /// peer's status.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status { status, .. } => Some(*status),
            Error::AllPeersUnreachable(last) => last.status(),
            _ => None,
        }
    }

    /// The response body of the last status error, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Error::Status { message, .. } => Some(message),
            Error::AllPeersUnreachable(last) => last.message(),
            _ => None,
        }
    }
}

/// Paths to TLS material, reloaded on every client rebuild.
///
/// `identity_pem` holds the client certificate and private key in one PEM
/// bundle; `ca_pem` holds the trust root for the config servers.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub identity_pem: Option<Utf8PathBuf>,
    pub ca_pem: Option<Utf8PathBuf>,
}

#[derive(Clone, Debug)]
pub struct FailoverConfig {
    /// Peer base URIs, e.g. `https://cfg1.example:4443`.
    pub peers: Vec<String>,
    pub tls: Option<TlsConfig>,
    pub request_timeout: Duration,
    pub tls_refresh_interval: Duration,
}

impl FailoverConfig {
    pub fn new(peers: Vec<String>) -> Self {
        Self {
            peers,
            tls: None,
            request_timeout: Duration::from_secs(30),
            tls_refresh_interval: Duration::from_secs(3600),
        }
    }
}

/// A client for one replicated service, failing over between its peers.
#[derive(Debug)]
pub struct FailoverClient {
    peers: Vec<Url>,
    client_rx: watch::Receiver<reqwest::Client>,
    refresher: Option<tokio::task::JoinHandle<()>>,
    log: Logger,
}

impl FailoverClient {
    /// Validates the peer list and TLS material, shuffles the peers once to
    /// spread load across the fleet, and (if TLS material was supplied)
    /// starts the periodic client rebuild task.
    ///
    /// Construction fails fast on malformed URIs or unreadable TLS material;
    /// those are configuration errors, not conditions to retry.
    pub fn new(config: FailoverConfig, log: &Logger) -> Result<Self, Error> {
        let mut peers = Self::parse_peers(&config.peers)?;
        peers.shuffle(&mut rand::thread_rng());
        Self::new_inner(peers, config, log)
    }

    /// Like [`FailoverClient::new`], but keeps the peer list in the order
    /// given. Tests that assert on which peer answers need this.
    #[cfg(test)]
    fn new_with_fixed_order(
        config: FailoverConfig,
        log: &Logger,
    ) -> Result<Self, Error> {
        let peers = Self::parse_peers(&config.peers)?;
        Self::new_inner(peers, config, log)
    }

    fn parse_peers(uris: &[String]) -> Result<Vec<Url>, Error> {
        if uris.is_empty() {
            return Err(Error::NoPeers);
        }
        uris.iter()
            .map(|uri| {
                Url::parse(uri).map_err(|err| Error::InvalidPeerUri {
                    uri: uri.clone(),
                    err,
                })
            })
            .collect()
    }

    fn new_inner(
        peers: Vec<Url>,
        config: FailoverConfig,
        log: &Logger,
    ) -> Result<Self, Error> {
        let log = log.new(o!("component" => "FailoverClient"));
        let client =
            build_client(config.tls.as_ref(), config.request_timeout)?;
        let (client_tx, client_rx) = watch::channel(client);

        // The key and trust material is rotated outside this process, so the
        // client is periodically rebuilt to pick it up. Readers snapshot the
        // current client at the start of each call.
        let refresher = config.tls.clone().map(|tls| {
            let refresh_log = log.clone();
            let request_timeout = config.request_timeout;
            let interval = config.tls_refresh_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(
                    tokio::time::MissedTickBehavior::Delay,
                );
                // The first tick completes immediately; skip it so we don't
                // rebuild the client we just built.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match build_client(Some(&tls), request_timeout) {
                        Ok(client) => {
                            debug!(refresh_log, "rebuilt HTTP client");
                            client_tx.send_replace(client);
                        }
                        Err(err) => {
                            // Keep serving with the previous client; the
                            // material may be mid-rotation.
                            warn!(
                                refresh_log,
                                "failed to rebuild HTTP client, keeping \
                                 current one";
                                "err" => %err,
                            );
                        }
                    }
                }
            })
        });

        Ok(Self { peers, client_rx, refresher, log })
    }

    /// The peer base URIs, in the order they will be tried.
    pub fn peers(&self) -> &[Url] {
        &self.peers
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, Error> {
        self.request(Method::GET, path, None::<&()>).await
    }

    pub async fn put<B, T>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(Method::PUT, path, body).await
    }

    pub async fn patch<B, T>(&self, path: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(Method::PATCH, path, Some(body)).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, Error> {
        self.request(Method::DELETE, path, None::<&()>).await
    }

    /// Sends `method path` to each peer in order until one answers.
    ///
    /// Connection failures and retryable statuses (5xx, 408, 429) advance to
    /// the next peer; these are expected while peers upgrade, so they log at
    /// reduced severity. Any other non-2xx status fails immediately without
    /// trying further peers. If every peer fails, the last error is returned
    /// wrapped in [`Error::AllPeersUnreachable`].
    pub async fn request<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        // One snapshot per call: a rebuild mid-call must not switch clients
        // under us.
        let client = self.client_rx.borrow().clone();
        let mut last_err = None;

        for peer in &self.peers {
            let url = peer.join(path).map_err(|err| Error::InvalidPath {
                path: path.to_string(),
                err,
            })?;

            let mut request = client.request(method.clone(), url);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    if err.is_connect() {
                        info!(
                            self.log,
                            "connection refused by config server \
                             (upgrading?), will try next";
                            "peer" => %peer,
                        );
                    } else {
                        warn!(
                            self.log,
                            "failed to communicate with config server, \
                             will try next";
                            "peer" => %peer,
                            "err" => %err,
                        );
                    }
                    last_err =
                        Some(Error::Unreachable { peer: peer.clone(), err });
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response.json().await.map_err(|err| {
                    Error::Deserialize { peer: peer.clone(), err }
                });
            }

            let message = response.text().await.unwrap_or_default();
            let err = Error::Status { peer: peer.clone(), status, message };
            if retryable_status(status) {
                warn!(
                    self.log,
                    "retryable error from config server, will try next";
                    "peer" => %peer,
                    "status" => %status,
                );
                last_err = Some(err);
                continue;
            }
            return Err(err);
        }

        // The peer list is validated non-empty at construction, so the loop
        // ran at least once.
        match last_err {
            Some(last) => Err(Error::AllPeersUnreachable(Box::new(last))),
            None => Err(Error::NoPeers),
        }
    }
}

impl Drop for FailoverClient {
    fn drop(&mut self) {
        if let Some(refresher) = &self.refresher {
            refresher.abort();
        }
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn build_client(
    tls: Option<&TlsConfig>,
    request_timeout: Duration,
) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(request_timeout)
        .connect_timeout(CONNECT_TIMEOUT);

    if let Some(tls) = tls {
        if let Some(path) = &tls.identity_pem {
            let pem = read_pem(path)?;
            let identity = reqwest::Identity::from_pem(&pem).map_err(
                |err| Error::InvalidTlsMaterial { path: path.clone(), err },
            )?;
            builder = builder.identity(identity);
        }
        if let Some(path) = &tls.ca_pem {
            let pem = read_pem(path)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|err| {
                Error::InvalidTlsMaterial { path: path.clone(), err }
            })?;
            builder = builder.add_root_certificate(cert);
        }
        builder = builder.use_rustls_tls();
    }

    builder.build().map_err(Error::BuildClient)
}

fn read_pem(path: &Utf8PathBuf) -> Result<Vec<u8>, Error> {
    std::fs::read(path)
        .map_err(|err| Error::TlsMaterialIo { path: path.clone(), err })
}
