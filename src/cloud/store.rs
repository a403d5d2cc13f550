// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Refreshable holder of the current API credentials and the client built from them.

use super::{CloudApi, CloudError, Credentials};
use crate::error::{CcmError, Result};
use sha2::{Digest, Sha256};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Builds an API client bound to one set of credentials
pub trait ClientFactory: Send + Sync {
    fn build(&self, credentials: &Credentials) -> std::result::Result<Arc<dyn CloudApi>, CloudError>;
}

/// A client together with the credentials it was built from.
///
/// Handles are never mutated; a refresh replaces the whole handle.
pub struct ClientHandle {
    credentials: Arc<Credentials>,
    api: Arc<dyn CloudApi>,
}

impl ClientHandle {
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

impl Deref for ClientHandle {
    type Target = dyn CloudApi;

    fn deref(&self) -> &Self::Target {
        self.api.as_ref()
    }
}

/// Owner of the current [`ClientHandle`].
///
/// Readers take a cheap clone of the current handle under a read lock and use it
/// for a single call. Refreshes build the new handle outside the lock and swap it
/// in under the write lock. Tokio's `RwLock` is write-preferring, so a steady
/// stream of readers cannot starve a refresh.
pub struct CredentialStore {
    factory: Arc<dyn ClientFactory>,
    current: RwLock<Arc<ClientHandle>>,
}

impl CredentialStore {
    pub fn new(factory: Arc<dyn ClientFactory>, credentials: Credentials) -> Result<Self> {
        let handle = build_handle(factory.as_ref(), credentials)?;
        info!(
            "Using Exoscale API credentials {} in zone {}",
            handle.credentials.label(),
            handle.zone()
        );

        Ok(Self {
            factory,
            current: RwLock::new(Arc::new(handle)),
        })
    }

    /// Create a store from a credentials file. Unlike later refreshes, a failure
    /// here is fatal since there is nothing to fall back to.
    pub async fn from_file(factory: Arc<dyn ClientFactory>, path: &Path) -> Result<Self> {
        info!("Reading Exoscale API credentials from file {}", path.display());
        let data = read_credentials_file(path).await?;
        Self::new(factory, Credentials::from_json(&data)?)
    }

    /// The presently active client handle
    pub async fn current(&self) -> Arc<ClientHandle> {
        self.current.read().await.clone()
    }

    /// Reload credentials from `path`. On failure the current handle is kept.
    #[instrument(skip(self))]
    pub async fn refresh(&self, path: &Path) -> Result<()> {
        let data = read_credentials_file(path).await.map_err(rejected)?;
        let credentials = Credentials::from_json(&data).map_err(rejected)?;
        self.install(credentials).await
    }

    /// Swap in a client built for `credentials` unless they are already in use
    async fn install(&self, credentials: Credentials) -> Result<()> {
        if credentials == *self.current().await.credentials {
            debug!("Exoscale API credentials unchanged");
            return Ok(());
        }

        let handle = build_handle(self.factory.as_ref(), credentials).map_err(rejected)?;
        let label = handle.credentials.label();
        *self.current.write().await = Arc::new(handle);
        info!("Exoscale API credentials refreshed, now using {}", label);
        Ok(())
    }

    /// Poll the credentials file and refresh on change. Runs forever; read
    /// failures and client construction failures are retried on the next
    /// tick, a malformed file only once it changes again.
    pub async fn watch(self: Arc<Self>, path: PathBuf, interval: Duration) -> anyhow::Result<()> {
        info!(
            "Watching credentials file {} every {:?}",
            path.display(),
            interval
        );

        let mut last: Option<Fingerprint> = None;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let (fingerprint, data) = match read_with_fingerprint(&path).await {
                Ok(read) => read,
                Err(e) => {
                    warn!("{}, retrying in {:?}", e, interval);
                    continue;
                }
            };

            if last.as_ref() == Some(&fingerprint) {
                continue;
            }

            debug!("Credentials file {} changed", path.display());
            let credentials = match Credentials::from_json(&data) {
                Ok(credentials) => credentials,
                Err(e) => {
                    rejected(e);
                    last = Some(fingerprint);
                    continue;
                }
            };

            if self.install(credentials).await.is_ok() {
                last = Some(fingerprint);
            }
        }
    }
}

fn rejected(e: CcmError) -> CcmError {
    error!("Failed to refresh Exoscale API credentials, keeping current ones: {}", e);
    e
}

fn build_handle(factory: &dyn ClientFactory, credentials: Credentials) -> Result<ClientHandle> {
    let api = factory.build(&credentials).map_err(|e| {
        CcmError::CredentialsError(format!(
            "failed to build API client for {}: {}",
            credentials.label(),
            e
        ))
    })?;

    Ok(ClientHandle {
        credentials: Arc::new(credentials),
        api,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
    digest: Vec<u8>,
}

async fn read_credentials_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        CcmError::CredentialsError(format!(
            "failed to read credentials file {}: {}",
            path.display(),
            e
        ))
    })
}

async fn read_with_fingerprint(path: &Path) -> Result<(Fingerprint, Vec<u8>)> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        CcmError::CredentialsError(format!(
            "failed to stat credentials file {}: {}",
            path.display(),
            e
        ))
    })?;
    let data = read_credentials_file(path).await?;

    let fingerprint = Fingerprint {
        len: metadata.len(),
        modified: metadata.modified().ok(),
        digest: Sha256::digest(&data).to_vec(),
    };
    Ok((fingerprint, data))
}
