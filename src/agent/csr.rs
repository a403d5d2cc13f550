// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Node CSR validation runner - approves kubelet serving certificates of
//! Nodes backed by a matching Compute instance.

use super::validation::{
    approval_condition, candidates, match_instance, precheck, PendingReason, RequestedIdentity,
    Verdict,
};
use crate::cloud::{Instance, InstanceLookup};
use crate::constants::csr;
use crate::error::Result;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::api::{PostParams, WatchEvent, WatchParams};
use kube::{Api, Client, ResourceExt};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub struct NodeCsrValidator {
    client: Client,
    lookup: Arc<InstanceLookup>,
}

impl NodeCsrValidator {
    pub fn new(client: Client, lookup: Arc<InstanceLookup>) -> Self {
        Self { client, lookup }
    }

    /// Watch CSRs forever. The short server-side watch timeout makes CSRs left
    /// pending get re-evaluated on every new watch.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("sks-agent: starting node-csr-validation runner");
        let csrs: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let pause = Duration::from_secs(csr::RECONNECT_PAUSE_SECS);

        loop {
            match self.watch_once(&csrs).await {
                Ok(()) => debug!("sks-agent: API server closed watcher channel"),
                Err(e) => error!("sks-agent: failed to watch CSR resources: {}", e),
            }
            tokio::time::sleep(pause).await;
        }
    }

    async fn watch_once(&self, csrs: &Api<CertificateSigningRequest>) -> Result<()> {
        let params = WatchParams::default().timeout(csr::WATCH_TIMEOUT_SECS);
        let mut events = csrs.watch(&params, "0").await?.boxed();
        debug!("sks-agent: watching for pending CSRs");

        while let Some(event) = events.try_next().await? {
            match event {
                WatchEvent::Added(request) => {
                    if let Err(e) = self.handle(&request).await {
                        error!(
                            "sks-agent: failed to approve CSR {}: {}",
                            request.name_any(),
                            e
                        );
                    }
                }
                WatchEvent::Error(e) => {
                    warn!("sks-agent: CSR watch returned an error: {:?}", e);
                    return Ok(());
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Validate one CSR and approve it when fully corroborated. Errors are
    /// only returned when submitting the approval fails.
    #[instrument(skip(self, request), fields(csr = %request.name_any()))]
    pub async fn handle(&self, request: &CertificateSigningRequest) -> Result<Verdict> {
        let name = request.name_any();

        let verdict = match precheck(request) {
            Err(verdict) => verdict,
            Ok(identity) => {
                debug!("sks-agent: checking pending CSR {}", name);
                match self.lookup.list_instances().await {
                    Ok(instances) => {
                        let provided = self.provided_addresses(&identity, &instances).await;
                        match_instance(&identity, &instances, &provided)
                    }
                    Err(e) if e.is_unauthorized() => {
                        Verdict::Pending(PendingReason::Unauthorized(e.to_string()))
                    }
                    Err(e) => Verdict::Pending(PendingReason::LookupFailed(e.to_string())),
                }
            }
        };

        match &verdict {
            Verdict::Ignored(_) => {}
            Verdict::Pending(reason) => log_pending(&name, reason),
            Verdict::Approved => {
                self.approve(request).await?;
                info!("sks-agent: CSR {} approved", name);
            }
        }

        Ok(verdict)
    }

    /// Addresses announced by the Nodes of privately networked candidate
    /// instances. Nodes that cannot be read are skipped.
    async fn provided_addresses(
        &self,
        identity: &RequestedIdentity,
        instances: &[Instance],
    ) -> HashMap<String, IpAddr> {
        let mut provided = HashMap::new();
        for instance in candidates(identity, instances).filter(|i| i.has_private_networks()) {
            match self.lookup.node_provided_ip(&instance.name).await {
                Ok(Some(ip)) => {
                    provided.insert(instance.name.clone(), ip);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "sks-agent: failed to retrieve Node {} provided IP address: {}",
                    instance.name, e
                ),
            }
        }
        provided
    }

    async fn approve(&self, request: &CertificateSigningRequest) -> Result<()> {
        let mut approved = request.clone();
        approved
            .status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
            .push(approval_condition(Utc::now()));

        let csrs: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        csrs.replace_subresource(
            "approval",
            &request.name_any(),
            &PostParams::default(),
            serde_json::to_vec(&approved)?,
        )
        .await?;

        Ok(())
    }
}

/// Requests no instance accounts for carry `security = true`
fn log_pending(name: &str, reason: &PendingReason) {
    let security = reason.is_security_relevant();
    match reason {
        PendingReason::Malformed(e) => error!("sks-agent: failed to parse CSR {}: {}", name, e),
        PendingReason::SanCount { dns, ip } => error!(
            "sks-agent: CSR {} must request exactly 1 DNS name and 1 IP address, got {} and {}",
            name, dns, ip
        ),
        PendingReason::LookupFailed(e) => {
            error!("sks-agent: failed to list Compute instances: {}", e)
        }
        PendingReason::Unauthorized(e) => warn!(
            "sks-agent: Exoscale API rejected credentials, waiting for credential refresh: {}",
            e
        ),
        PendingReason::AddressMismatch {
            instance_addresses,
            requested,
        } => error!(
            security,
            "sks-agent: CSR {} Node IP addresses don't match corresponding Compute instance IP addresses {:?}, got {:?}",
            name, instance_addresses, requested
        ),
        PendingReason::NoMatchingInstance => error!(
            security,
            "sks-agent: CSR {} doesn't match any Compute instance", name
        ),
    }
}
