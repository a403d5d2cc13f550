// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use exoscale_ccm::agent::{AgentRunner, NodeCsrValidator};
use exoscale_ccm::cloud::{CredentialStore, ExoscaleClientFactory, InstanceLookup};
use exoscale_ccm::config::{Config, CredentialSource};
use exoscale_ccm::constants::cloud::CREDENTIALS_POLL_INTERVAL_SECS;
use exoscale_ccm::loadbalancer::LoadBalancerManager;
use exoscale_ccm::reconcilers::ServiceReconciler;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Exoscale cloud controller manager");

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: zone={} endpoint={}",
        config.zone, config.endpoint
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let factory = Arc::new(ExoscaleClientFactory::new(config.endpoint.clone(), config.zone.clone()));
    let store = Arc::new(match &config.credentials {
        CredentialSource::Static(credentials) => CredentialStore::new(factory, credentials.clone())?,
        CredentialSource::File(path) => CredentialStore::from_file(factory, path).await?,
    });

    if config.instances.disabled {
        info!("Instances lookup disabled in configuration, node lookups will be refused");
    }
    let lookup = Arc::new(InstanceLookup::new(
        client.clone(),
        store.clone(),
        config.instances.clone(),
    ));

    let mut tasks: Vec<BoxFuture<'static, Result<()>>> = Vec::new();

    if let CredentialSource::File(path) = &config.credentials {
        info!("Watching API credentials file {}", path.display());
        tasks.push(
            store
                .clone()
                .watch(path.clone(), Duration::from_secs(CREDENTIALS_POLL_INTERVAL_SECS))
                .boxed(),
        );
    }

    if config.load_balancer_enabled {
        let manager = LoadBalancerManager::new(client.clone(), store.clone(), lookup.clone());
        tasks.push(ServiceReconciler::new(client.clone(), manager).run().boxed());
    } else {
        info!("Load balancer controller disabled in configuration");
    }

    for runner in &config.sks_agent_runners {
        match runner {
            AgentRunner::NodeCsrValidation => {
                info!("Starting SKS agent runner {}", runner);
                tasks.push(NodeCsrValidator::new(client.clone(), lookup.clone()).run().boxed());
            }
        }
    }

    if tasks.is_empty() {
        warn!("Nothing to run, all controllers are disabled");
        return Ok(());
    }

    try_join_all(tasks).await?;

    warn!("All controllers stopped unexpectedly");
    Ok(())
}
