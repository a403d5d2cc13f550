// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Read-through translation of Kubernetes Node identities to Compute instances and zones

use super::{CredentialStore, Instance};
use crate::config::InstancesConfig;
use crate::constants::{PROVIDED_NODE_IP_ANNOTATION, PROVIDER_PREFIX};
use crate::error::{CcmError, Result};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client, ResourceExt};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Failure domain of a Node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub region: String,
}

/// Strip the `exoscale://` scheme from a Node provider ID
pub fn parse_provider_id(provider_id: &str) -> Result<&str> {
    if provider_id.is_empty() {
        return Err(CcmError::LookupError("provider ID cannot be empty".to_string()));
    }
    Ok(provider_id.strip_prefix(PROVIDER_PREFIX).unwrap_or(provider_id))
}

/// The Compute instance ID of a Node, which is its system UUID
pub fn node_instance_id(node: &Node) -> Result<String> {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|info| info.system_uuid.to_lowercase())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            CcmError::LookupError(format!(
                "node {} has no system UUID",
                node.metadata.name.as_deref().unwrap_or_default()
            ))
        })
}

pub struct InstanceLookup {
    client: Client,
    store: Arc<CredentialStore>,
    instances: InstancesConfig,
}

impl InstanceLookup {
    pub fn new(client: Client, store: Arc<CredentialStore>, instances: InstancesConfig) -> Self {
        Self {
            client,
            store,
            instances,
        }
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        Ok(self.store.current().await.list_instances().await?)
    }

    /// Resolve a Node to its instance through its system UUID
    pub async fn instance_for_node(&self, node: &Node) -> Result<Instance> {
        let id = node_instance_id(node)?;
        Ok(self.store.current().await.get_instance(&id).await?)
    }

    #[instrument(skip(self))]
    pub async fn instance_by_node_name(&self, node_name: &str) -> Result<Instance> {
        self.ensure_enabled()?;
        let node = self.get_node(node_name).await?;
        self.instance_for_node(&node).await
    }

    pub async fn zone_by_provider_id(&self, provider_id: &str) -> Result<Zone> {
        self.ensure_enabled()?;
        if let Some(zone) = self.override_zone(self.instances.override_for_provider_id(provider_id))? {
            return Ok(zone);
        }

        parse_provider_id(provider_id)?;
        // Nodes cannot live in a different zone than the controller
        Ok(Zone {
            region: self.store.current().await.zone().to_string(),
        })
    }

    #[instrument(skip(self))]
    pub async fn zone_by_node_name(&self, node_name: &str) -> Result<Zone> {
        self.ensure_enabled()?;
        if let Some(zone) = self.override_zone(self.instances.override_for_node(node_name))? {
            return Ok(zone);
        }

        let node = self.get_node(node_name).await?;
        self.zone_by_provider_id(&node_instance_id(&node)?).await
    }

    /// Address the kubelet announced for a Node, `None` when the Node or its
    /// annotation does not exist
    pub async fn node_provided_ip(&self, node_name: &str) -> Result<Option<IpAddr>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let Some(node) = nodes.get_opt(node_name).await? else {
            return Ok(None);
        };

        let Some(value) = node.annotations().get(PROVIDED_NODE_IP_ANNOTATION) else {
            return Ok(None);
        };
        match value.parse() {
            Ok(ip) => Ok(Some(ip)),
            Err(_) => {
                warn!("Node {} has an invalid {} annotation: {}", node_name, PROVIDED_NODE_IP_ANNOTATION, value);
                Ok(None)
            }
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.instances.disabled {
            return Err(CcmError::LookupError(
                "instances lookup disabled in configuration".to_string(),
            ));
        }
        Ok(())
    }

    /// Zone from a matching external override. Fails when only overrides may
    /// be consulted and none applies.
    fn override_zone(&self, found: Option<&crate::config::InstanceOverride>) -> Result<Option<Zone>> {
        match found {
            Some(o) if o.external => {
                debug!("Using static override {} for zone lookup", o.name);
                Ok(Some(Zone {
                    region: o.zone_region().to_string(),
                }))
            }
            _ if self.instances.external_only => Err(CcmError::LookupError(
                "no instance override found (Exoscale API disabled)".to_string(),
            )),
            _ => Ok(None),
        }
    }

    async fn get_node(&self, node_name: &str) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes.get(node_name).await.map_err(|e| {
            CcmError::LookupError(format!(
                "failed to retrieve node {} from the apiserver: {}",
                node_name, e
            ))
        })
    }
}
