// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Minimal Service patches computed from the last observed copy.

use crate::error::{CcmError, Result};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

/// JSON merge patch turning `current` into `modified`. Removed keys are set
/// to null and arrays are replaced whole.
pub fn two_way_merge_patch(current: &Value, modified: &Value) -> Value {
    match (current, modified) {
        (Value::Object(current), Value::Object(modified)) => {
            let mut patch = Map::new();

            for (key, wanted) in modified {
                match current.get(key) {
                    Some(existing) if existing == wanted => {}
                    Some(existing @ Value::Object(_)) if wanted.is_object() => {
                        let nested = two_way_merge_patch(existing, wanted);
                        if !is_empty_patch(&nested) {
                            patch.insert(key.clone(), nested);
                        }
                    }
                    _ => {
                        patch.insert(key.clone(), wanted.clone());
                    }
                }
            }

            for key in current.keys().filter(|k| !modified.contains_key(*k)) {
                patch.insert(key.clone(), Value::Null);
            }

            Value::Object(patch)
        }
        _ => modified.clone(),
    }
}

pub fn is_empty_patch(patch: &Value) -> bool {
    match patch {
        Value::Object(map) => map.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

/// Patches a Service relative to the copy it was created with
pub struct ServicePatcher {
    api: Api<Service>,
    current: Service,
}

impl ServicePatcher {
    pub fn new(client: Client, current: &Service) -> Self {
        let namespace = current.namespace().unwrap_or_default();
        Self {
            api: Api::namespaced(client, &namespace),
            current: current.clone(),
        }
    }

    /// Submit the difference between the observed and `modified` Service.
    /// Status changes go through the status subresource. Returns false when
    /// there was nothing to patch.
    #[instrument(skip(self, modified), fields(service = %self.current.name_any()))]
    pub async fn patch(&self, modified: &Service) -> Result<bool> {
        let name = self.current.name_any();
        let mut patch = two_way_merge_patch(
            &serde_json::to_value(&self.current)?,
            &serde_json::to_value(modified)?,
        );
        let status = patch.as_object_mut().and_then(|p| p.remove("status"));

        let mut patched = false;
        if !is_empty_patch(&patch) {
            debug!("Patching service {}: {}", name, patch);
            self.api
                .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| self.patch_error(e))?;
            patched = true;
        }

        if let Some(status) = status.filter(|s| !is_empty_patch(s)) {
            let patch = serde_json::json!({ "status": status });
            debug!("Patching service {} status: {}", name, patch);
            self.api
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| self.patch_error(e))?;
            patched = true;
        }

        Ok(patched)
    }

    fn patch_error(&self, e: kube::Error) -> CcmError {
        debug!(
            "Failed to patch service {}/{}: {}",
            self.current.namespace().unwrap_or_default(),
            self.current.name_any(),
            e
        );
        CcmError::KubeError(e)
    }
}
