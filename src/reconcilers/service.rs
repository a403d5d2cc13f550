// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Service reconciler - keeps an NLB behind every Service of type LoadBalancer.

use crate::constants::{requeue, LOAD_BALANCER_FINALIZER};
use crate::error::{CcmError, Result};
use crate::loadbalancer::LoadBalancerManager;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Patch, PatchParams},
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event},
        Controller,
    },
    Api, Client, ResourceExt,
};
use kube_runtime::watcher::Config as WatcherConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct ServiceReconciler {
    client: Client,
    manager: LoadBalancerManager,
}

impl ServiceReconciler {
    pub fn new(client: Client, manager: LoadBalancerManager) -> Self {
        Self { client, manager }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let services: Api<Service> = Api::all(self.client.clone());
        let context = Arc::new(self);

        info!("Starting load balancer controller");
        Controller::new(services, WatcherConfig::default())
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled service: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        Ok(())
    }
}

/// Type LoadBalancer without a class, i.e. handled by the default provider
pub fn is_load_balancer(service: &Service) -> bool {
    service.spec.as_ref().is_some_and(|spec| {
        spec.type_.as_deref() == Some("LoadBalancer") && spec.load_balancer_class.is_none()
    })
}

fn has_finalizer(service: &Service) -> bool {
    service.finalizers().iter().any(|f| f == LOAD_BALANCER_FINALIZER)
}

/// Services this controller acts upon: current load balancers, and former
/// ones still holding our finalizer
pub fn is_managed(service: &Service) -> bool {
    is_load_balancer(service) || has_finalizer(service)
}

async fn reconcile(service: Arc<Service>, ctx: Arc<ServiceReconciler>) -> Result<Action> {
    if !is_managed(&service) {
        return Ok(Action::await_change());
    }

    let namespace = service.namespace().unwrap_or_default();
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&services, LOAD_BALANCER_FINALIZER, service, |event| {
        handle_event(event, &ctx, &services)
    })
    .await
    .map_err(CcmError::from)
}

async fn handle_event(
    event: Event<Service>,
    ctx: &ServiceReconciler,
    services: &Api<Service>,
) -> Result<Action> {
    match event {
        Event::Apply(service) if is_load_balancer(&service) => {
            debug!("Ensuring NLB for service {}", service.name_any());
            ctx.manager.ensure(&service).await?;
            Ok(Action::requeue(Duration::from_secs(requeue::RESYNC_SECS)))
        }
        Event::Apply(service) => {
            info!(
                "Service {} is no longer of type LoadBalancer, releasing its NLB",
                service.name_any()
            );
            ctx.manager.ensure_deleted(&service).await?;
            release(services, &service).await?;
            Ok(Action::await_change())
        }
        Event::Cleanup(service) => {
            info!("Service {} deleted, releasing its NLB", service.name_any());
            ctx.manager.ensure_deleted(&service).await?;
            Ok(Action::await_change())
        }
    }
}

/// Drop our finalizer from a live Service
async fn release(services: &Api<Service>, service: &Service) -> Result<()> {
    let remaining: Vec<&String> = service
        .finalizers()
        .iter()
        .filter(|f| *f != LOAD_BALANCER_FINALIZER)
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": remaining } });
    services
        .patch(&service.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn error_policy(service: Arc<Service>, error: &CcmError, _ctx: Arc<ServiceReconciler>) -> Action {
    if error.is_unauthorized() {
        warn!(
            "Exoscale API rejected credentials while reconciling service {}, waiting for credential refresh: {}",
            service.name_any(),
            error
        );
        return Action::requeue(Duration::from_secs(requeue::UNAUTHORIZED_SECS));
    }

    error!("Reconciliation error for service {}: {}", service.name_any(), error);
    Action::requeue(Duration::from_secs(requeue::ERROR_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudError, InstanceLookup};
    use crate::config::InstancesConfig;
    use crate::test_utils::{fake_store, make_service, FakeCloud, MockService};

    fn make_reconciler() -> Arc<ServiceReconciler> {
        let client = MockService::new().into_client();
        let store = fake_store(Arc::new(FakeCloud::new("ch-gva-2")));
        let lookup = Arc::new(InstanceLookup::new(
            client.clone(),
            store.clone(),
            InstancesConfig::default(),
        ));
        Arc::new(ServiceReconciler::new(
            client.clone(),
            LoadBalancerManager::new(client, store, lookup),
        ))
    }

    #[test]
    fn test_only_classless_load_balancers_are_managed() {
        let service = make_service("web", "uid-1", &[(80, 30080)], &[]);
        assert!(is_managed(&service));

        let mut classed = service.clone();
        classed.spec.as_mut().unwrap().load_balancer_class = Some("example.com/lb".to_string());
        assert!(!is_managed(&classed));

        let mut cluster_ip = service.clone();
        cluster_ip.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_string());
        assert!(!is_managed(&cluster_ip));

        cluster_ip.metadata.finalizers = Some(vec![LOAD_BALANCER_FINALIZER.to_string()]);
        assert!(is_managed(&cluster_ip));
        assert!(!is_load_balancer(&cluster_ip));
    }

    #[tokio::test]
    async fn test_error_policy_backs_off_on_rejected_credentials() {
        let ctx = make_reconciler();
        let service = Arc::new(make_service("web", "uid-1", &[(80, 30080)], &[]));

        let unauthorized = CcmError::CloudError(CloudError::Unauthorized("revoked".to_string()));
        assert_eq!(
            error_policy(service.clone(), &unauthorized, ctx.clone()),
            Action::requeue(Duration::from_secs(requeue::UNAUTHORIZED_SECS))
        );

        let other = CcmError::InvalidService("port 80 has no node port allocated".to_string());
        assert_eq!(
            error_policy(service, &other, ctx),
            Action::requeue(Duration::from_secs(requeue::ERROR_SECS))
        );
    }
}
