// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Exoscale v2 REST client

use super::store::ClientFactory;
use super::{
    CloudApi, CloudError, Credentials, Healthcheck, Instance, InstanceManager, LiveService,
    LoadBalancer, NlbServiceSpec, Operation, OperationState,
};
use crate::constants::{cloud, USER_AGENT};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Seconds a request signature stays valid
const SIGNATURE_VALIDITY_SECS: i64 = 600;

/// Default API endpoint for an environment and zone, e.g. `https://api-ch-gva-2.exoscale.com/v2`
pub fn default_endpoint(environment: &str, zone: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!("https://{}-{}.exoscale.com/v2", environment, zone))
}

pub struct ExoscaleClient {
    http: reqwest::Client,
    endpoint: Url,
    zone: String,
    credentials: Arc<Credentials>,
    poll_interval: Duration,
    operation_deadline: Duration,
}

impl ExoscaleClient {
    pub fn new(
        endpoint: Url,
        zone: impl Into<String>,
        credentials: Arc<Credentials>,
    ) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(cloud::REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            endpoint,
            zone: zone.into(),
            credentials,
            poll_interval: Duration::from_secs(cloud::OPERATION_POLL_INTERVAL_SECS),
            operation_deadline: Duration::from_secs(cloud::OPERATION_DEADLINE_SECS),
        })
    }

    pub fn with_operation_timings(mut self, poll_interval: Duration, deadline: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.operation_deadline = deadline;
        self
    }

    fn url(&self, path: &str) -> Result<Url, CloudError> {
        let raw = format!("{}{}", self.endpoint.as_str().trim_end_matches('/'), path);
        Url::parse(&raw).map_err(|e| CloudError::Decode(format!("invalid URL {}: {}", raw, e)))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, CloudError> {
        let url = self.url(path)?;
        let payload = match body {
            Some(body) => serde_json::to_vec(body).map_err(|e| CloudError::Decode(e.to_string()))?,
            None => Vec::new(),
        };

        let expires = Utc::now().timestamp() + SIGNATURE_VALIDITY_SECS;
        let authorization = sign_request(
            &self.credentials,
            method.as_str(),
            url.path(),
            &payload,
            expires,
        )?;

        debug!("{} {}", method, url);
        let mut request = self
            .http
            .request(method, url)
            .header(AUTHORIZATION, authorization);
        if body.is_some() {
            request = request.header(CONTENT_TYPE, "application/json").body(payload);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| CloudError::Decode(format!("{}: {}", path, e)));
        }

        let text = response.text().await.unwrap_or_default();
        Err(error_for_status(status, path, &text))
    }

    async fn get_operation(&self, id: &str) -> Result<Operation, CloudError> {
        let op: WireOperation = self
            .request(Method::GET, &format!("/operation/{}", id), None)
            .await?;
        op.into_model()
    }

    async fn mutate(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Operation, CloudError> {
        let op: WireOperation = self.request(method, path, body.as_ref()).await?;
        op.into_model()
    }
}

#[async_trait]
impl CloudApi for ExoscaleClient {
    fn zone(&self) -> &str {
        &self.zone
    }

    fn api_key(&self) -> &str {
        &self.credentials.api_key
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, CloudError> {
        let list: WireInstanceList = self.request(Method::GET, "/instance", None).await?;
        Ok(list
            .instances
            .into_iter()
            .map(|i| i.into_model(&self.zone))
            .collect())
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, CloudError> {
        let instance: WireInstance = self
            .request(Method::GET, &format!("/instance/{}", id), None)
            .await?;
        Ok(instance.into_model(&self.zone))
    }

    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancer>, CloudError> {
        let list: WireLoadBalancerList = self.request(Method::GET, "/load-balancer", None).await?;
        list.load_balancers
            .into_iter()
            .map(WireLoadBalancer::into_model)
            .collect()
    }

    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer, CloudError> {
        let lb: WireLoadBalancer = self
            .request(Method::GET, &format!("/load-balancer/{}", id), None)
            .await?;
        lb.into_model()
    }

    async fn create_load_balancer(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Operation, CloudError> {
        let body = serde_json::json!({ "name": name, "description": description });
        self.mutate(Method::POST, "/load-balancer", Some(body)).await
    }

    async fn update_load_balancer(
        &self,
        id: &str,
        name: &str,
        description: &str,
    ) -> Result<Operation, CloudError> {
        let body = serde_json::json!({ "name": name, "description": description });
        self.mutate(Method::PUT, &format!("/load-balancer/{}", id), Some(body))
            .await
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<Operation, CloudError> {
        self.mutate(Method::DELETE, &format!("/load-balancer/{}", id), None)
            .await
    }

    async fn add_load_balancer_service(
        &self,
        load_balancer_id: &str,
        service: &NlbServiceSpec,
    ) -> Result<Operation, CloudError> {
        self.mutate(
            Method::POST,
            &format!("/load-balancer/{}/service", load_balancer_id),
            Some(service_body(service)?),
        )
        .await
    }

    async fn update_load_balancer_service(
        &self,
        load_balancer_id: &str,
        service_id: &str,
        service: &NlbServiceSpec,
    ) -> Result<Operation, CloudError> {
        self.mutate(
            Method::PUT,
            &format!("/load-balancer/{}/service/{}", load_balancer_id, service_id),
            Some(service_body(service)?),
        )
        .await
    }

    async fn delete_load_balancer_service(
        &self,
        load_balancer_id: &str,
        service_id: &str,
    ) -> Result<Operation, CloudError> {
        self.mutate(
            Method::DELETE,
            &format!("/load-balancer/{}/service/{}", load_balancer_id, service_id),
            None,
        )
        .await
    }

    #[instrument(skip(self, operation), fields(operation = %operation.id))]
    async fn wait_operation(&self, operation: Operation) -> Result<Operation, CloudError> {
        let id = operation.id.clone();
        let poll = async {
            let mut current = operation;
            loop {
                match current.state {
                    OperationState::Success => return Ok(current),
                    OperationState::Pending => {
                        tokio::time::sleep(self.poll_interval).await;
                        current = self.get_operation(&current.id).await?;
                    }
                    state => {
                        return Err(CloudError::OperationFailed {
                            id: current.id,
                            state: state.to_string(),
                            message: current.message.unwrap_or_default(),
                        })
                    }
                }
            }
        };

        tokio::time::timeout(self.operation_deadline, poll)
            .await
            .map_err(|_| CloudError::Timeout(id))?
    }
}

/// Builds [`ExoscaleClient`]s for a fixed endpoint and zone
pub struct ExoscaleClientFactory {
    endpoint: Url,
    zone: String,
}

impl ExoscaleClientFactory {
    pub fn new(endpoint: Url, zone: impl Into<String>) -> Self {
        Self {
            endpoint,
            zone: zone.into(),
        }
    }
}

impl ClientFactory for ExoscaleClientFactory {
    fn build(&self, credentials: &Credentials) -> Result<Arc<dyn CloudApi>, CloudError> {
        let client = ExoscaleClient::new(
            self.endpoint.clone(),
            self.zone.clone(),
            Arc::new(credentials.clone()),
        )?;
        Ok(Arc::new(client))
    }
}

/// String-to-sign for the EXO2-HMAC-SHA256 scheme: request line, body, signed
/// query values, signed header values, expiry timestamp.
fn signature_message(method: &str, path: &str, body: &[u8], expires: i64) -> String {
    format!(
        "{} {}\n{}\n\n\n{}",
        method,
        path,
        String::from_utf8_lossy(body),
        expires
    )
}

fn sign_request(
    credentials: &Credentials,
    method: &str,
    path: &str,
    body: &[u8],
    expires: i64,
) -> Result<String, CloudError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(credentials.api_secret.as_bytes())
        .map_err(|e| CloudError::Decode(format!("invalid API secret: {}", e)))?;
    mac.update(signature_message(method, path, body, expires).as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "EXO2-HMAC-SHA256 credential={},expires={},signature={}",
        credentials.api_key, expires, signature
    ))
}

fn error_for_status(status: StatusCode, path: &str, body: &str) -> CloudError {
    let message = serde_json::from_str::<WireError>(body)
        .ok()
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.trim().to_string());

    match status {
        StatusCode::NOT_FOUND => CloudError::NotFound(path.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::Unauthorized(message),
        _ => CloudError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

fn service_body(service: &NlbServiceSpec) -> Result<serde_json::Value, CloudError> {
    serde_json::to_value(WireService::from(service)).map_err(|e| CloudError::Decode(e.to_string()))
}

#[derive(Deserialize)]
struct WireError {
    message: Option<String>,
}

#[derive(Deserialize)]
struct WireInstanceList {
    #[serde(default)]
    instances: Vec<WireInstance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WireInstance {
    id: String,
    #[serde(default)]
    name: String,
    public_ip: Option<String>,
    ipv6_address: Option<String>,
    manager: Option<WireManager>,
    #[serde(default)]
    private_networks: Vec<WireRef>,
}

#[derive(Deserialize)]
struct WireManager {
    id: String,
    #[serde(rename = "type")]
    kind: String,
}

impl WireInstance {
    fn into_model(self, zone: &str) -> Instance {
        Instance {
            id: self.id,
            name: self.name,
            public_ipv4: self.public_ip.and_then(|ip| ip.parse().ok()),
            public_ipv6: self.ipv6_address.and_then(|ip| ip.parse().ok()),
            zone: zone.to_string(),
            manager: self.manager.map(|m| InstanceManager {
                id: m.id,
                kind: m.kind,
            }),
            private_network_ids: self.private_networks.into_iter().map(|n| n.id).collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WireLoadBalancerList {
    #[serde(default)]
    load_balancers: Vec<WireLoadBalancer>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WireLoadBalancer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    ip: Option<String>,
    state: Option<String>,
    created_at: Option<String>,
    #[serde(default)]
    services: Vec<WireService>,
}

impl WireLoadBalancer {
    fn into_model(self) -> Result<LoadBalancer, CloudError> {
        let services = self
            .services
            .into_iter()
            .map(WireService::into_model)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(LoadBalancer {
            id: self.id,
            name: self.name,
            description: self.description,
            ip: self.ip.and_then(|ip| ip.parse().ok()),
            state: self.state,
            created_at: self.created_at,
            services,
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WireService {
    #[serde(default, skip_serializing)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    description: String,
    protocol: String,
    port: u16,
    target_port: u16,
    strategy: String,
    instance_pool: WireRef,
    healthcheck: WireHealthcheck,
    #[serde(default, skip_serializing)]
    state: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireRef {
    id: String,
}

#[derive(Serialize, Deserialize)]
struct WireHealthcheck {
    mode: String,
    port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    uri: String,
    /// Seconds
    interval: u64,
    /// Seconds
    timeout: u64,
    retries: u32,
}

impl From<&NlbServiceSpec> for WireService {
    fn from(spec: &NlbServiceSpec) -> Self {
        WireService {
            id: None,
            name: spec.name.clone(),
            description: spec.description.clone(),
            protocol: spec.protocol.to_string(),
            port: spec.port,
            target_port: spec.target_port,
            strategy: spec.strategy.to_string(),
            instance_pool: WireRef {
                id: spec.instance_pool_id.clone(),
            },
            healthcheck: WireHealthcheck {
                mode: spec.healthcheck.mode.to_string(),
                port: spec.healthcheck.port,
                uri: spec.healthcheck.uri.clone(),
                interval: spec.healthcheck.interval.as_secs(),
                timeout: spec.healthcheck.timeout.as_secs(),
                retries: spec.healthcheck.retries,
            },
            state: None,
        }
    }
}

impl WireService {
    fn into_model(self) -> Result<LiveService, CloudError> {
        let id = self
            .id
            .ok_or_else(|| CloudError::Decode(format!("NLB service {} has no ID", self.name)))?;

        let spec = NlbServiceSpec {
            protocol: self.protocol.parse().map_err(CloudError::Decode)?,
            strategy: self.strategy.parse().map_err(CloudError::Decode)?,
            name: self.name,
            description: self.description,
            port: self.port,
            target_port: self.target_port,
            instance_pool_id: self.instance_pool.id,
            healthcheck: Healthcheck {
                mode: self.healthcheck.mode.parse().map_err(CloudError::Decode)?,
                port: self.healthcheck.port,
                uri: self.healthcheck.uri,
                interval: Duration::from_secs(self.healthcheck.interval),
                timeout: Duration::from_secs(self.healthcheck.timeout),
                retries: self.healthcheck.retries,
            },
        };

        Ok(LiveService {
            id,
            spec,
            state: self.state,
        })
    }
}

#[derive(Deserialize)]
struct WireOperation {
    id: String,
    state: String,
    reference: Option<WireRef>,
    message: Option<String>,
}

impl WireOperation {
    fn into_model(self) -> Result<Operation, CloudError> {
        Ok(Operation {
            state: self.state.parse().map_err(CloudError::Decode)?,
            id: self.id,
            reference: self.reference.map(|r| r.id),
            message: self.message,
        })
    }
}
