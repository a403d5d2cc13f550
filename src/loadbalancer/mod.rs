// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Network Load Balancers backing Services of type LoadBalancer.

pub mod annotations;
pub mod diff;

use crate::cloud::{
    ClientHandle, CloudError, CredentialStore, InstanceLookup, LoadBalancer, LoadBalancerSpec,
    NlbServiceSpec, Operation,
};
use crate::constants::annotations as keys;
use crate::error::{CcmError, Result};
use crate::kubernetes::ServicePatcher;
use annotations::{
    annotation, default_load_balancer_name, desired_load_balancer, is_external, service_ports,
    service_uid,
};
use diff::{plan, plan_deletion, Change};
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Node, Service};
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Drives NLBs towards what Service annotations declare
pub struct LoadBalancerManager {
    client: Client,
    store: Arc<CredentialStore>,
    lookup: Arc<InstanceLookup>,
}

impl LoadBalancerManager {
    pub fn new(client: Client, store: Arc<CredentialStore>, lookup: Arc<InstanceLookup>) -> Self {
        Self {
            client,
            store,
            lookup,
        }
    }

    /// Current client handle, taken afresh for every cloud call
    async fn cloud(&self) -> Arc<ClientHandle> {
        self.store.current().await
    }

    async fn complete(&self, operation: Operation) -> Result<Operation> {
        Ok(self.cloud().await.wait_operation(operation).await?)
    }

    /// Create or converge the NLB of a Service, then record its ID, name and
    /// ingress IP on the Service.
    #[instrument(skip(self, service), fields(service = %service.name_any()))]
    pub async fn ensure(&self, service: &Service) -> Result<LoadBalancerStatus> {
        let instance_pool_id = match annotation(service, keys::SERVICE_INSTANCE_POOL_ID)
            .filter(|id| !id.is_empty())
        {
            Some(id) => id.to_string(),
            None => {
                debug!("No NLB service Instance Pool ID specified in Service annotations, inferring from cluster Nodes");
                let id = self.infer_instance_pool().await?;
                debug!("Inferred NLB service Instance Pool ID from cluster Nodes: {}", id);
                id
            }
        };

        let desired = desired_load_balancer(service, &instance_pool_id)?;
        let external = is_external(service);

        let load_balancer = match self.find(service, &desired).await? {
            Some(live) => {
                self.converge(&live, &desired, external).await?;
                live
            }
            None if external => {
                return Err(CcmError::InvalidService(
                    "NLB instance marked as external in Service annotations, cannot create"
                        .to_string(),
                ))
            }
            None => self.create(&desired).await?,
        };

        let status = ingress_status(&load_balancer);

        let mut modified = service.clone();
        let annotations = modified.metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(keys::LOAD_BALANCER_ID.to_string(), load_balancer.id.clone());
        if !external {
            annotations.insert(keys::LOAD_BALANCER_NAME.to_string(), desired.name.clone());
        }
        annotations.insert(keys::SERVICE_INSTANCE_POOL_ID.to_string(), instance_pool_id);
        modified.status.get_or_insert_with(Default::default).load_balancer = Some(status.clone());

        if ServicePatcher::new(self.client.clone(), service).patch(&modified).await? {
            debug!("Service {} updated with NLB {}", service.name_any(), load_balancer.id);
        }

        Ok(status)
    }

    /// Remove the NLB services exposing the Service's ports, and the NLB itself
    /// once nothing else uses it
    #[instrument(skip(self, service), fields(service = %service.name_any()))]
    pub async fn ensure_deleted(&self, service: &Service) -> Result<()> {
        let Some(live) = self.fetch(service).await? else {
            debug!("No NLB to delete for Service {}", service.name_any());
            return Ok(());
        };

        let ports: Vec<u16> = service_ports(service)
            .iter()
            .filter_map(|p| u16::try_from(p.port).ok())
            .collect();
        let external = is_external(service);
        let deletion = plan_deletion(&live, &ports, external);

        for (id, name) in &deletion.services {
            info!("Deleting NLB service {}/{}", live.name, name);
            let op = self
                .cloud()
                .await
                .delete_load_balancer_service(&live.id, id)
                .await?;
            self.complete(op).await?;
        }

        if deletion.delete_load_balancer {
            info!("Deleting NLB {:?}", live.name);
            let op = self.cloud().await.delete_load_balancer(&live.id).await?;
            self.complete(op).await?;
        } else if external {
            debug!("NLB instance marked as external in Service annotations, skipping delete");
        }

        Ok(())
    }

    /// Ingress status of the NLB referenced by the Service, if it exists
    pub async fn status(&self, service: &Service) -> Result<Option<LoadBalancerStatus>> {
        Ok(self.fetch(service).await?.map(|lb| ingress_status(&lb)))
    }

    /// NLB referenced by the ID annotation
    async fn fetch(&self, service: &Service) -> Result<Option<LoadBalancer>> {
        let Some(id) = annotation(service, keys::LOAD_BALANCER_ID).filter(|id| !id.is_empty())
        else {
            return Ok(None);
        };

        match self.cloud().await.get_load_balancer(id).await {
            Ok(lb) => Ok(Some(lb)),
            Err(e) if e.is_not_found() => {
                warn!("NLB {} referenced by Service {} not found", id, service.name_any());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// NLB referenced by the ID annotation, or one previously created under
    /// the default name whose ID never made it onto the Service
    async fn find(&self, service: &Service, desired: &LoadBalancerSpec) -> Result<Option<LoadBalancer>> {
        if desired.id.is_some() {
            return self.fetch(service).await;
        }

        if desired.name != default_load_balancer_name(service_uid(service)?) {
            return Ok(None);
        }

        let candidate = self
            .cloud()
            .await
            .list_load_balancers()
            .await?
            .into_iter()
            .find(|lb| lb.name == desired.name);

        match candidate {
            Some(lb) => {
                info!("Adopting existing NLB {:?} (ID: {})", lb.name, lb.id);
                Ok(Some(self.cloud().await.get_load_balancer(&lb.id).await?))
            }
            None => Ok(None),
        }
    }

    async fn create(&self, desired: &LoadBalancerSpec) -> Result<LoadBalancer> {
        info!("Creating new NLB {:?}", desired.name);
        let op = self
            .cloud()
            .await
            .create_load_balancer(&desired.name, &desired.description)
            .await?;
        let op = self.complete(op).await?;
        let id = op.reference.ok_or_else(|| {
            CloudError::Decode(format!("operation {} did not reference the new NLB", op.id))
        })?;
        debug!("NLB {:?} created successfully (ID: {})", desired.name, id);

        for service in &desired.services {
            self.add_service(&desired.name, &id, service).await?;
        }

        Ok(self.cloud().await.get_load_balancer(&id).await?)
    }

    async fn converge(&self, live: &LoadBalancer, desired: &LoadBalancerSpec, external: bool) -> Result<()> {
        let changes = plan(live, desired, external);
        if changes.is_empty() {
            debug!("NLB {:?} is up to date", live.name);
            return Ok(());
        }

        for change in changes {
            match change {
                Change::UpdateLoadBalancer { name, description } => {
                    info!("Updating NLB {:?}", live.name);
                    let op = self
                        .cloud()
                        .await
                        .update_load_balancer(&live.id, &name, &description)
                        .await?;
                    self.complete(op).await?;
                }
                Change::DeleteService { id, name } => {
                    info!(
                        "NLB service {}/{} doesn't match any service port, deleting",
                        live.name, name
                    );
                    let op = self
                        .cloud()
                        .await
                        .delete_load_balancer_service(&live.id, &id)
                        .await?;
                    self.complete(op).await?;
                }
                Change::UpdateService { id, spec } => {
                    info!("Updating NLB service {}/{}", live.name, spec.name);
                    let op = self
                        .cloud()
                        .await
                        .update_load_balancer_service(&live.id, &id, &spec)
                        .await?;
                    self.complete(op).await?;
                }
                Change::AddService(spec) => self.add_service(&live.name, &live.id, &spec).await?,
            }
        }

        Ok(())
    }

    async fn add_service(&self, lb_name: &str, lb_id: &str, spec: &NlbServiceSpec) -> Result<()> {
        info!("Creating new NLB service {}/{}", lb_name, spec.name);
        let op = self
            .cloud()
            .await
            .add_load_balancer_service(lb_id, spec)
            .await?;
        let op = self.complete(op).await?;
        debug!(
            "NLB service {}/{} created successfully (ID: {})",
            lb_name,
            spec.name,
            op.reference.unwrap_or_default()
        );
        Ok(())
    }

    /// Instance Pool shared by every pool-managed cluster Node. Standalone
    /// instances are skipped.
    async fn infer_instance_pool(&self) -> Result<String> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let mut found: Option<String> = None;

        for node in nodes.list(&ListParams::default()).await?.items {
            let instance = self.lookup.instance_for_node(&node).await.map_err(|e| {
                CcmError::LookupError(format!(
                    "error retrieving Compute instance information for node {}: {}",
                    node.name_any(),
                    e
                ))
            })?;

            let Some(pool) = instance.instance_pool_id() else {
                continue;
            };
            if found.as_deref().is_some_and(|existing| existing != pool) {
                return Err(CcmError::InvalidService(
                    "multiple Instance Pools detected across cluster Nodes, an Instance Pool ID must be specified in Service manifest annotations".to_string(),
                ));
            }
            found = Some(pool.to_string());
        }

        found.ok_or_else(|| {
            CcmError::InvalidService("couldn't infer any Instance Pool from cluster Nodes".to_string())
        })
    }
}

fn ingress_status(load_balancer: &LoadBalancer) -> LoadBalancerStatus {
    LoadBalancerStatus {
        ingress: load_balancer.ip.map(|ip| {
            vec![LoadBalancerIngress {
                ip: Some(ip.to_string()),
                ..Default::default()
            }]
        }),
    }
}
