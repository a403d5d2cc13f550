// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Exoscale compute and network API: resource model, client seam and credential handling.

pub mod client;
pub mod credentials;
pub mod lookup;
pub mod store;

pub use client::{ExoscaleClient, ExoscaleClientFactory};
pub use credentials::Credentials;
pub use lookup::{InstanceLookup, Zone};
pub use store::{ClientFactory, ClientHandle, CredentialStore};

use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("API credentials rejected: {0}")]
    Unauthorized(String),

    #[error("API request failed (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("operation {id} ended in state {state}: {message}")]
    OperationFailed {
        id: String,
        state: String,
        message: String,
    },

    #[error("timed out waiting for operation {0}")]
    Timeout(String),

    #[error("unexpected API response: {0}")]
    Decode(String),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CloudError::Unauthorized(_))
    }
}

/// A Compute instance as seen by the Exoscale API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub public_ipv4: Option<Ipv4Addr>,
    pub public_ipv6: Option<Ipv6Addr>,
    pub zone: String,
    pub manager: Option<InstanceManager>,
    /// IDs of the private networks the instance is attached to
    pub private_network_ids: Vec<String>,
}

/// Entity managing an instance, e.g. an Instance Pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceManager {
    pub id: String,
    pub kind: String,
}

impl Instance {
    /// Public addresses in preference order, IPv4 first
    pub fn public_addresses(&self) -> Vec<IpAddr> {
        self.public_ipv4
            .map(IpAddr::V4)
            .into_iter()
            .chain(self.public_ipv6.map(IpAddr::V6))
            .collect()
    }

    pub fn has_private_networks(&self) -> bool {
        !self.private_network_ids.is_empty()
    }

    pub fn instance_pool_id(&self) -> Option<&str> {
        self.manager
            .as_ref()
            .filter(|m| m.kind == "instance-pool")
            .map(|m| m.id.as_str())
    }
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal, { $($variant:ident => $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $value),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($value => Ok($name::$variant),)+
                    other => Err(format!(
                        "unsupported {} {:?} (expected one of: {})",
                        $what,
                        other,
                        [$($value),+].join(", ")
                    )),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(
    /// Transport protocol forwarded by an NLB service
    Protocol, "protocol", { Tcp => "tcp", Udp => "udp" }
);

string_enum!(
    /// NLB service balancing strategy
    Strategy, "strategy", {
        RoundRobin => "round-robin",
        SourceHash => "source-hash",
        MaglevHash => "maglev-hash",
    }
);

string_enum!(
    HealthcheckMode, "healthcheck mode", { Tcp => "tcp", Http => "http", Https => "https" }
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Healthcheck {
    pub mode: HealthcheckMode,
    pub port: u16,
    pub uri: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

/// Managed fields of an NLB service. Desired and live services share this shape,
/// so comparing two values compares exactly what the reconciler owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NlbServiceSpec {
    pub name: String,
    pub description: String,
    pub protocol: Protocol,
    pub port: u16,
    pub target_port: u16,
    pub strategy: Strategy,
    pub instance_pool_id: String,
    pub healthcheck: Healthcheck,
}

/// Desired NLB, derived from a Service on every pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerSpec {
    pub id: Option<String>,
    pub name: String,
    pub description: String,
    pub services: Vec<NlbServiceSpec>,
}

/// Live NLB service: managed spec plus provider-owned outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveService {
    pub id: String,
    pub spec: NlbServiceSpec,
    pub state: Option<String>,
}

/// Live NLB as returned by the API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancer {
    pub id: String,
    pub name: String,
    pub description: String,
    pub ip: Option<IpAddr>,
    pub state: Option<String>,
    pub created_at: Option<String>,
    pub services: Vec<LiveService>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Success,
    Failure,
    Timeout,
}

impl FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationState::Pending),
            "success" => Ok(OperationState::Success),
            "failure" => Ok(OperationState::Failure),
            "timeout" => Ok(OperationState::Timeout),
            other => Err(format!("unknown operation state {:?}", other)),
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationState::Pending => "pending",
            OperationState::Success => "success",
            OperationState::Failure => "failure",
            OperationState::Timeout => "timeout",
        })
    }
}

/// Handle on an asynchronous API job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: String,
    pub state: OperationState,
    /// ID of the resource the operation acted upon
    pub reference: Option<String>,
    pub message: Option<String>,
}

/// Black-box RPC surface of the Exoscale API used by the controller.
///
/// An implementation is bound to one set of credentials and one zone. Mutating
/// calls return an [`Operation`] which callers drive to completion with
/// [`CloudApi::wait_operation`].
#[async_trait]
pub trait CloudApi: Send + Sync {
    fn zone(&self) -> &str;

    /// API key the client signs requests with
    fn api_key(&self) -> &str;

    async fn list_instances(&self) -> Result<Vec<Instance>, CloudError>;

    async fn get_instance(&self, id: &str) -> Result<Instance, CloudError>;

    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancer>, CloudError>;

    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer, CloudError>;

    async fn create_load_balancer(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Operation, CloudError>;

    async fn update_load_balancer(
        &self,
        id: &str,
        name: &str,
        description: &str,
    ) -> Result<Operation, CloudError>;

    async fn delete_load_balancer(&self, id: &str) -> Result<Operation, CloudError>;

    async fn add_load_balancer_service(
        &self,
        load_balancer_id: &str,
        service: &NlbServiceSpec,
    ) -> Result<Operation, CloudError>;

    async fn update_load_balancer_service(
        &self,
        load_balancer_id: &str,
        service_id: &str,
        service: &NlbServiceSpec,
    ) -> Result<Operation, CloudError>;

    async fn delete_load_balancer_service(
        &self,
        load_balancer_id: &str,
        service_id: &str,
    ) -> Result<Operation, CloudError>;

    /// Poll an operation until it reaches a terminal state.
    /// Fails unless the final state is [`OperationState::Success`].
    async fn wait_operation(&self, operation: Operation) -> Result<Operation, CloudError>;
}
