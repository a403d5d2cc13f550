// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Translation of Service annotations into a desired NLB.

use crate::cloud::{
    Healthcheck, HealthcheckMode, LoadBalancerSpec, NlbServiceSpec, Protocol, Strategy,
};
use crate::constants::{annotations, defaults};
use crate::error::{CcmError, Result};
use k8s_openapi::api::core::v1::{Service, ServicePort};
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::time::Duration;

pub fn annotation<'a>(service: &'a Service, key: &str) -> Option<&'a str> {
    service
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn annotation_or<'a>(service: &'a Service, key: &str, default: &'a str) -> &'a str {
    annotation(service, key).unwrap_or(default)
}

/// True when the NLB is managed outside of the controller
pub fn is_external(service: &Service) -> bool {
    annotation(service, annotations::LOAD_BALANCER_EXTERNAL)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

pub fn service_uid(service: &Service) -> Result<&str> {
    service.metadata.uid.as_deref().ok_or_else(|| {
        CcmError::InvalidService(format!("service {} has no UID", service.name_any()))
    })
}

pub fn default_load_balancer_name(uid: &str) -> String {
    format!("k8s-{}", uid)
}

/// Stable NLB service name for a Service port, unique per (UID, port)
pub fn default_service_name(uid: &str, port: u16) -> String {
    format!("k8s-{:x}", Sha256::digest(format!("{}-{}", uid, port).as_bytes()))
}

pub fn load_balancer_name(service: &Service) -> Result<String> {
    match annotation(service, annotations::LOAD_BALANCER_NAME) {
        Some(name) => Ok(name.to_string()),
        None => Ok(default_load_balancer_name(service_uid(service)?)),
    }
}

pub fn service_ports(service: &Service) -> &[ServicePort] {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default()
}

fn invalid(key: &str, message: impl std::fmt::Display) -> CcmError {
    CcmError::InvalidAnnotation(format!("{}: {}", key, message))
}

/// Parse a duration annotation, truncated to whole seconds
fn duration_annotation(service: &Service, key: &str, default: &str) -> Result<Duration> {
    let value = annotation_or(service, key, default);
    let parsed = humantime::parse_duration(value)
        .map_err(|e| invalid(key, format!("invalid duration {:?}: {}", value, e)))?;

    let seconds = Duration::from_secs(parsed.as_secs());
    if seconds.is_zero() {
        return Err(invalid(key, format!("duration {:?} must be at least 1s", value)));
    }
    Ok(seconds)
}

/// Annotation-driven settings shared by every NLB service of a Service
struct SharedSettings {
    strategy: Strategy,
    mode: HealthcheckMode,
    uri: String,
    interval: Duration,
    timeout: Duration,
    retries: u32,
}

impl SharedSettings {
    fn from_service(service: &Service) -> Result<Self> {
        let strategy_value = annotation_or(
            service,
            annotations::SERVICE_STRATEGY,
            defaults::SERVICE_STRATEGY,
        );
        let strategy = strategy_value
            .parse::<Strategy>()
            .map_err(|e| invalid(annotations::SERVICE_STRATEGY, e))?;

        let mode_value = annotation_or(
            service,
            annotations::SERVICE_HEALTHCHECK_MODE,
            defaults::HEALTHCHECK_MODE,
        );
        let mode = mode_value
            .parse::<HealthcheckMode>()
            .map_err(|e| invalid(annotations::SERVICE_HEALTHCHECK_MODE, e))?;

        let retries_value = annotation_or(
            service,
            annotations::SERVICE_HEALTHCHECK_RETRIES,
            defaults::HEALTHCHECK_RETRIES,
        );
        let retries = retries_value.trim().parse::<u32>().map_err(|_| {
            invalid(
                annotations::SERVICE_HEALTHCHECK_RETRIES,
                format!("{:?} is not a valid retry count", retries_value),
            )
        })?;

        Ok(Self {
            strategy,
            mode,
            uri: annotation_or(service, annotations::SERVICE_HEALTHCHECK_URI, "").to_string(),
            interval: duration_annotation(
                service,
                annotations::SERVICE_HEALTHCHECK_INTERVAL,
                defaults::HEALTHCHECK_INTERVAL,
            )?,
            timeout: duration_annotation(
                service,
                annotations::SERVICE_HEALTHCHECK_TIMEOUT,
                defaults::HEALTHCHECK_TIMEOUT,
            )?,
            retries,
        })
    }
}

/// Build the desired NLB for a Service whose NLB services target `instance_pool_id`
pub fn desired_load_balancer(service: &Service, instance_pool_id: &str) -> Result<LoadBalancerSpec> {
    let uid = service_uid(service)?;
    let ports = service_ports(service);
    let settings = SharedSettings::from_service(service)?;

    let explicit_name = annotation(service, annotations::SERVICE_NAME);
    let explicit_description = annotation(service, annotations::SERVICE_DESCRIPTION);
    if ports.len() > 1 && (explicit_name.is_some() || explicit_description.is_some()) {
        return Err(CcmError::InvalidAnnotation(format!(
            "{} and {} are ambiguous on a Service exposing {} ports",
            annotations::SERVICE_NAME,
            annotations::SERVICE_DESCRIPTION,
            ports.len()
        )));
    }

    let mut services = Vec::with_capacity(ports.len());
    for port in ports {
        let protocol = port
            .protocol
            .as_deref()
            .unwrap_or("TCP")
            .parse::<Protocol>()
            .map_err(CcmError::InvalidService)?;
        let external_port = u16::try_from(port.port)
            .map_err(|_| CcmError::InvalidService(format!("invalid port {}", port.port)))?;
        let node_port = port
            .node_port
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                CcmError::InvalidService(format!(
                    "port {} has no node port allocated",
                    port.port
                ))
            })?;

        services.push(NlbServiceSpec {
            name: explicit_name
                .map(String::from)
                .unwrap_or_else(|| default_service_name(uid, external_port)),
            description: explicit_description.unwrap_or_default().to_string(),
            protocol,
            port: external_port,
            target_port: node_port,
            strategy: settings.strategy,
            instance_pool_id: instance_pool_id.to_string(),
            healthcheck: Healthcheck {
                mode: settings.mode,
                port: node_port,
                uri: settings.uri.clone(),
                interval: settings.interval,
                timeout: settings.timeout,
                retries: settings.retries,
            },
        });
    }

    Ok(LoadBalancerSpec {
        id: annotation(service, annotations::LOAD_BALANCER_ID)
            .filter(|id| !id.is_empty())
            .map(String::from),
        name: load_balancer_name(service)?,
        description: annotation_or(service, annotations::LOAD_BALANCER_DESCRIPTION, "")
            .to_string(),
        services,
    })
}
