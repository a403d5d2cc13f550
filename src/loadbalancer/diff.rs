// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Minimal change sets between a live NLB and the desired one.

use crate::cloud::{LoadBalancer, LoadBalancerSpec, NlbServiceSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    UpdateLoadBalancer { name: String, description: String },
    DeleteService { id: String, name: String },
    UpdateService { id: String, spec: NlbServiceSpec },
    AddService(NlbServiceSpec),
}

/// Changes converging `live` onto `desired`, in execution order: NLB update,
/// deletions, updates, additions. Live services are matched to desired ones
/// by name. An external NLB is never renamed and its unmatched services are
/// left alone since they may belong to another Service.
pub fn plan(live: &LoadBalancer, desired: &LoadBalancerSpec, external: bool) -> Vec<Change> {
    let mut changes = Vec::new();

    if !external && (live.name != desired.name || live.description != desired.description) {
        changes.push(Change::UpdateLoadBalancer {
            name: desired.name.clone(),
            description: desired.description.clone(),
        });
    }

    if !external {
        for stale in live
            .services
            .iter()
            .filter(|l| !desired.services.iter().any(|d| d.name == l.spec.name))
        {
            changes.push(Change::DeleteService {
                id: stale.id.clone(),
                name: stale.spec.name.clone(),
            });
        }
    }

    let mut additions = Vec::new();
    for wanted in &desired.services {
        match live.services.iter().find(|l| l.spec.name == wanted.name) {
            Some(current) if current.spec != *wanted => changes.push(Change::UpdateService {
                id: current.id.clone(),
                spec: wanted.clone(),
            }),
            Some(_) => {}
            None => additions.push(Change::AddService(wanted.clone())),
        }
    }
    changes.extend(additions);

    changes
}

/// What to remove when a Service goes away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    /// (id, name) of the NLB services exposing one of the Service's ports
    pub services: Vec<(String, String)>,
    pub delete_load_balancer: bool,
}

/// NLB services whose port matches one of `ports` are removed. The NLB itself
/// goes only once nothing else is left on it, and never when external.
pub fn plan_deletion(live: &LoadBalancer, ports: &[u16], external: bool) -> Deletion {
    let services: Vec<(String, String)> = live
        .services
        .iter()
        .filter(|s| ports.contains(&s.spec.port))
        .map(|s| (s.id.clone(), s.spec.name.clone()))
        .collect();

    let remaining = live.services.len() - services.len();
    Deletion {
        services,
        delete_load_balancer: remaining == 0 && !external,
    }
}
