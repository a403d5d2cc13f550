// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Node CSR validation pipeline.
//!
//! Checks run in order and stop at the first one that fails:
//! already decided, requester groups, PEM/DER parsing and signature,
//! SAN counts, then corroboration against the Compute instance inventory.

use crate::cloud::Instance;
use crate::constants::csr;
use chrono::{DateTime, Utc};
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509CertificationRequest};

const PEM_LABEL: &str = "CERTIFICATE REQUEST";

/// Outcome of validating one CSR
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Not ours to judge, skipped without logging
    Ignored(IgnoreReason),
    /// Left pending for an operator
    Pending(PendingReason),
    Approved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    AlreadyDecided,
    MissingGroups,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingReason {
    Malformed(String),
    SanCount { dns: usize, ip: usize },
    LookupFailed(String),
    /// The Exoscale API rejected the current credentials
    Unauthorized(String),
    NoMatchingInstance,
    AddressMismatch {
        instance_addresses: Vec<IpAddr>,
        requested: Vec<IpAddr>,
    },
}

impl PendingReason {
    /// A request for a name or address that no instance accounts for, as
    /// opposed to a malformed request or an unavailable API
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            PendingReason::NoMatchingInstance | PendingReason::AddressMismatch { .. }
        )
    }
}

/// Identity a Node asks to be certified for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedIdentity {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

/// True once any approval or denial condition is present
pub fn is_decided(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| !c.is_empty())
}

pub fn has_required_groups(csr: &CertificateSigningRequest) -> bool {
    let groups = csr.spec.groups.as_deref().unwrap_or_default();
    csr::REQUIRED_GROUPS
        .iter()
        .all(|required| groups.iter().any(|g| g == required))
}

/// Decode a PEM `CERTIFICATE REQUEST`, verify its self-signature and extract
/// the requested subject alternative names
pub fn parse_csr(pem: &[u8]) -> Result<RequestedIdentity, String> {
    let (_, pem) = parse_x509_pem(pem).map_err(|e| format!("failed to decode PEM: {}", e))?;
    if pem.label != PEM_LABEL {
        return Err(format!("PEM block type must be {}", PEM_LABEL));
    }

    let (_, request) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| format!("failed to parse certificate request: {}", e))?;
    request
        .verify_signature()
        .map_err(|e| format!("invalid certificate request signature: {}", e))?;

    let common_name = request
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(String::from);

    let mut identity = RequestedIdentity {
        common_name,
        dns_names: Vec::new(),
        ip_addresses: Vec::new(),
    };

    for extension in request.requested_extensions().into_iter().flatten() {
        if let ParsedExtension::SubjectAlternativeName(san) = extension {
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(dns) => identity.dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(raw) => identity.ip_addresses.push(ip_from_bytes(raw)?),
                    _ => {}
                }
            }
        }
    }

    Ok(identity)
}

fn ip_from_bytes(raw: &[u8]) -> Result<IpAddr, String> {
    if let Ok(octets) = <[u8; 4]>::try_from(raw) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(raw) {
        return Ok(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    Err(format!("invalid IP address SAN of {} bytes", raw.len()))
}

/// Everything that can be decided without asking the cloud
pub fn precheck(csr: &CertificateSigningRequest) -> Result<RequestedIdentity, Verdict> {
    if is_decided(csr) {
        return Err(Verdict::Ignored(IgnoreReason::AlreadyDecided));
    }
    if !has_required_groups(csr) {
        return Err(Verdict::Ignored(IgnoreReason::MissingGroups));
    }

    let identity = parse_csr(&csr.spec.request.0)
        .map_err(|e| Verdict::Pending(PendingReason::Malformed(e)))?;

    if identity.dns_names.len() != 1 || identity.ip_addresses.len() != 1 {
        return Err(Verdict::Pending(PendingReason::SanCount {
            dns: identity.dns_names.len(),
            ip: identity.ip_addresses.len(),
        }));
    }

    Ok(identity)
}

/// Instances named after the requested DNS name
pub fn candidates<'a>(
    identity: &'a RequestedIdentity,
    instances: &'a [Instance],
) -> impl Iterator<Item = &'a Instance> + 'a {
    instances
        .iter()
        .filter(move |i| identity.dns_names.first() == Some(&i.name))
}

/// Approve only when an instance carries the requested DNS name as its name and
/// the requested IP as one of its public addresses. Instances attached to a
/// private network also accept the address their Node announced, found in
/// `provided` under the instance name.
pub fn match_instance(
    identity: &RequestedIdentity,
    instances: &[Instance],
    provided: &HashMap<String, IpAddr>,
) -> Verdict {
    let (Some(_), Some(requested_ip)) = (identity.dns_names.first(), identity.ip_addresses.first())
    else {
        return Verdict::Pending(PendingReason::SanCount {
            dns: identity.dns_names.len(),
            ip: identity.ip_addresses.len(),
        });
    };

    let mut mismatch = None;
    for instance in candidates(identity, instances) {
        let mut addresses = instance.public_addresses();
        if instance.has_private_networks() {
            addresses.extend(provided.get(&instance.name).copied());
        }
        if addresses.contains(requested_ip) {
            return Verdict::Approved;
        }
        mismatch.get_or_insert(addresses);
    }

    match mismatch {
        Some(instance_addresses) => Verdict::Pending(PendingReason::AddressMismatch {
            instance_addresses,
            requested: identity.ip_addresses.clone(),
        }),
        None => Verdict::Pending(PendingReason::NoMatchingInstance),
    }
}

pub fn approval_condition(now: DateTime<Utc>) -> CertificateSigningRequestCondition {
    CertificateSigningRequestCondition {
        type_: "Approved".to_string(),
        status: "True".to_string(),
        reason: Some(csr::APPROVAL_REASON.to_string()),
        message: Some(csr::APPROVAL_MESSAGE.to_string()),
        last_update_time: Some(Time(now)),
        last_transition_time: None,
    }
}
