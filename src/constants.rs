// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// Service annotation keys recognized by the load balancer reconciler
pub mod annotations {
    /// ID of the NLB backing the Service, written back after creation
    pub const LOAD_BALANCER_ID: &str = "service.beta.kubernetes.io/exoscale-loadbalancer-id";
    pub const LOAD_BALANCER_NAME: &str = "service.beta.kubernetes.io/exoscale-loadbalancer-name";
    pub const LOAD_BALANCER_DESCRIPTION: &str =
        "service.beta.kubernetes.io/exoscale-loadbalancer-description";
    /// When set to "true", the NLB is managed outside of the controller
    pub const LOAD_BALANCER_EXTERNAL: &str =
        "service.beta.kubernetes.io/exoscale-loadbalancer-external";
    pub const SERVICE_NAME: &str = "service.beta.kubernetes.io/exoscale-loadbalancer-service-name";
    pub const SERVICE_DESCRIPTION: &str =
        "service.beta.kubernetes.io/exoscale-loadbalancer-service-description";
    pub const SERVICE_STRATEGY: &str =
        "service.beta.kubernetes.io/exoscale-loadbalancer-service-strategy";
    pub const SERVICE_INSTANCE_POOL_ID: &str =
        "service.beta.kubernetes.io/exoscale-loadbalancer-service-instancepool-id";
    pub const SERVICE_HEALTHCHECK_MODE: &str =
        "service.beta.kubernetes.io/exoscale-loadbalancer-service-healthcheck-mode";
    pub const SERVICE_HEALTHCHECK_URI: &str =
        "service.beta.kubernetes.io/exoscale-loadbalancer-service-healthcheck-uri";
    pub const SERVICE_HEALTHCHECK_INTERVAL: &str =
        "service.beta.kubernetes.io/exoscale-loadbalancer-service-healthcheck-interval";
    pub const SERVICE_HEALTHCHECK_TIMEOUT: &str =
        "service.beta.kubernetes.io/exoscale-loadbalancer-service-healthcheck-timeout";
    pub const SERVICE_HEALTHCHECK_RETRIES: &str =
        "service.beta.kubernetes.io/exoscale-loadbalancer-service-healthcheck-retries";
}

/// Defaults applied when an annotation is absent
pub mod defaults {
    pub const SERVICE_STRATEGY: &str = "round-robin";
    pub const HEALTHCHECK_MODE: &str = "tcp";
    pub const HEALTHCHECK_INTERVAL: &str = "10s";
    pub const HEALTHCHECK_TIMEOUT: &str = "5s";
    pub const HEALTHCHECK_RETRIES: &str = "1";
}

/// Finalizer guarding NLB cleanup on Service deletion
pub const LOAD_BALANCER_FINALIZER: &str = "service.kubernetes.io/load-balancer-cleanup";

/// Node address set by the kubelet from its --node-ip flag
pub const PROVIDED_NODE_IP_ANNOTATION: &str = "alpha.kubernetes.io/provided-node-ip";

/// Node provider IDs are "exoscale://<instance id>"
pub const PROVIDER_PREFIX: &str = "exoscale://";

pub const USER_AGENT: &str = concat!("Exoscale-K8s-Cloud-Controller/", env!("CARGO_PKG_VERSION"));

/// Node CSR validation agent
pub mod csr {
    pub const APPROVAL_REASON: &str = "ExoscaleCloudControllerApproved";
    pub const APPROVAL_MESSAGE: &str =
        "This CSR was approved by the Exoscale Cloud Controller Manager";

    /// RBAC groups the requester must belong to
    pub const REQUIRED_GROUPS: [&str; 2] = ["system:authenticated", "system:nodes"];

    /// Kept short so CSRs that failed validation get a new chance soon
    pub const WATCH_TIMEOUT_SECS: u32 = 120;
    pub const RECONNECT_PAUSE_SECS: u64 = 10;
}

/// Cloud API client timings
pub mod cloud {
    pub const REQUEST_TIMEOUT_SECS: u64 = 60;
    pub const OPERATION_POLL_INTERVAL_SECS: u64 = 3;
    pub const OPERATION_DEADLINE_SECS: u64 = 600;
    pub const CREDENTIALS_POLL_INTERVAL_SECS: u64 = 10;
}

/// Requeue intervals for the Service controller
pub mod requeue {
    pub const RESYNC_SECS: u64 = 600;
    pub const ERROR_SECS: u64 = 60;
    pub const UNAUTHORIZED_SECS: u64 = 30;
}
