// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Test utilities: a recording Kubernetes API mock, an in-memory Exoscale
//! API and resource builders.

use crate::cloud::{
    ClientFactory, CloudApi, CloudError, CredentialStore, Credentials, Instance, InstanceManager,
    LiveService, LoadBalancer, NlbServiceSpec, Operation, OperationState,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::BodyExt;
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestSpec};
use k8s_openapi::api::core::v1::{
    Node, NodeStatus, NodeSystemInfo, Service as KubeService, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::client::Body;
use kube::Client;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// A request received by [`MockService`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

/// A mock HTTP service that returns predefined responses based on request paths
/// and records every request it receives.
#[derive(Clone)]
pub struct MockService {
    responses: Arc<Mutex<HashMap<(String, String), (u16, String)>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn on(self, method: &str, path: &str, status: u16, body: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), (status, body.to_string()));
        self
    }

    /// Add a response for GET requests matching the path
    pub fn on_get(self, path: &str, status: u16, body: &str) -> Self {
        self.on("GET", path, status, body)
    }

    pub fn on_put(self, path: &str, status: u16, body: &str) -> Self {
        self.on("PUT", path, status, body)
    }

    pub fn on_patch(self, path: &str, status: u16, body: &str) -> Self {
        self.on("PATCH", path, status, body)
    }

    /// Build a kube Client from this mock service
    pub fn into_client(self) -> Client {
        Client::new(self, "https://kubernetes.default.svc")
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_with(&self, method: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    fn find_response(&self, method: &str, path: &str) -> Option<(u16, String)> {
        let responses = self.responses.lock().unwrap();

        // Try exact match first
        if let Some(resp) = responses.get(&(method.to_string(), path.to_string())) {
            return Some(resp.clone());
        }

        // Prefix match covers subresources like .../services/web/status
        for ((m, p), resp) in responses.iter() {
            if m == method && path.starts_with(p) {
                return Some(resp.clone());
            }
        }

        None
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let response = self.find_response(&method, &path);
        let requests = self.requests.clone();

        Box::pin(async move {
            let body = req.into_body().collect().await?.to_bytes();
            requests.lock().unwrap().push(RecordedRequest {
                method,
                path,
                body,
            });

            match response {
                Some((status, body)) => Ok(Response::builder()
                    .status(status)
                    .header("content-type", "application/json")
                    .body(Body::from(body.into_bytes()))
                    .unwrap()),
                None => {
                    // Default 404 for unmatched requests
                    let body = r#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"not found","reason":"NotFound","code":404}"#;
                    Ok(Response::builder()
                        .status(404)
                        .header("content-type", "application/json")
                        .body(Body::from(body.as_bytes().to_vec()))
                        .unwrap())
                }
            }
        })
    }
}

#[derive(Default)]
struct FakeState {
    instances: Vec<Instance>,
    load_balancers: Vec<LoadBalancer>,
    calls: Vec<String>,
    next_id: u32,
    unauthorized: bool,
}

/// In-memory Exoscale API. Operations complete immediately.
pub struct FakeCloud {
    zone: String,
    api_key: String,
    state: Mutex<FakeState>,
}

impl FakeCloud {
    pub fn new(zone: &str) -> Self {
        Self {
            zone: zone.to_string(),
            api_key: "EXOfake".to_string(),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = api_key.to_string();
        self
    }

    pub fn add_instance(&self, instance: Instance) {
        self.state.lock().unwrap().instances.push(instance);
    }

    pub fn load_balancers(&self) -> Vec<LoadBalancer> {
        self.state.lock().unwrap().load_balancers.clone()
    }

    /// Every call so far as "<method> <args>"
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                ["create_", "update_", "delete_", "add_"]
                    .iter()
                    .any(|prefix| c.starts_with(prefix))
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Reject every call as if the credentials had been revoked
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.state.lock().unwrap().unauthorized = unauthorized;
    }

    fn call<T>(
        &self,
        call: String,
        f: impl FnOnce(&mut FakeState) -> Result<T, CloudError>,
    ) -> Result<T, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.unauthorized {
            return Err(CloudError::Unauthorized(format!("key {} revoked", self.api_key)));
        }
        f(&mut state)
    }
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn operation(&mut self, reference: &str) -> Operation {
        Operation {
            id: self.next_id("op"),
            state: OperationState::Success,
            reference: Some(reference.to_string()),
            message: None,
        }
    }

    fn load_balancer_mut(&mut self, id: &str) -> Result<&mut LoadBalancer, CloudError> {
        self.load_balancers
            .iter_mut()
            .find(|lb| lb.id == id)
            .ok_or_else(|| CloudError::NotFound(format!("load balancer {}", id)))
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    fn zone(&self) -> &str {
        &self.zone
    }

    fn api_key(&self) -> &str {
        &self.api_key
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, CloudError> {
        self.call("list_instances".to_string(), |s| Ok(s.instances.clone()))
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, CloudError> {
        self.call(format!("get_instance {}", id), |s| {
            s.instances
                .iter()
                .find(|i| i.id == id)
                .cloned()
                .ok_or_else(|| CloudError::NotFound(format!("instance {}", id)))
        })
    }

    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancer>, CloudError> {
        self.call("list_load_balancers".to_string(), |s| {
            Ok(s.load_balancers.clone())
        })
    }

    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer, CloudError> {
        self.call(format!("get_load_balancer {}", id), |s| {
            s.load_balancer_mut(id).map(|lb| lb.clone())
        })
    }

    async fn create_load_balancer(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Operation, CloudError> {
        self.call(format!("create_load_balancer {}", name), |s| {
            let id = s.next_id("lb");
            let ip: IpAddr = format!("192.0.2.{}", s.next_id % 250 + 1)
                .parse()
                .map_err(|_| CloudError::Decode("ip".to_string()))?;
            s.load_balancers.push(LoadBalancer {
                id: id.clone(),
                name: name.to_string(),
                description: description.to_string(),
                ip: Some(ip),
                state: Some("running".to_string()),
                created_at: None,
                services: Vec::new(),
            });
            Ok(s.operation(&id))
        })
    }

    async fn update_load_balancer(
        &self,
        id: &str,
        name: &str,
        description: &str,
    ) -> Result<Operation, CloudError> {
        self.call(format!("update_load_balancer {}", id), |s| {
            let lb = s.load_balancer_mut(id)?;
            lb.name = name.to_string();
            lb.description = description.to_string();
            Ok(s.operation(id))
        })
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<Operation, CloudError> {
        self.call(format!("delete_load_balancer {}", id), |s| {
            s.load_balancer_mut(id)?;
            s.load_balancers.retain(|lb| lb.id != id);
            Ok(s.operation(id))
        })
    }

    async fn add_load_balancer_service(
        &self,
        load_balancer_id: &str,
        service: &NlbServiceSpec,
    ) -> Result<Operation, CloudError> {
        self.call(
            format!("add_load_balancer_service {} {}", load_balancer_id, service.name),
            |s| {
                let id = s.next_id("svc");
                s.load_balancer_mut(load_balancer_id)?.services.push(LiveService {
                    id: id.clone(),
                    spec: service.clone(),
                    state: Some("running".to_string()),
                });
                Ok(s.operation(&id))
            },
        )
    }

    async fn update_load_balancer_service(
        &self,
        load_balancer_id: &str,
        service_id: &str,
        service: &NlbServiceSpec,
    ) -> Result<Operation, CloudError> {
        self.call(
            format!("update_load_balancer_service {} {}", load_balancer_id, service_id),
            |s| {
                let live = s
                    .load_balancer_mut(load_balancer_id)?
                    .services
                    .iter_mut()
                    .find(|l| l.id == service_id)
                    .ok_or_else(|| CloudError::NotFound(format!("service {}", service_id)))?;
                live.spec = service.clone();
                Ok(s.operation(service_id))
            },
        )
    }

    async fn delete_load_balancer_service(
        &self,
        load_balancer_id: &str,
        service_id: &str,
    ) -> Result<Operation, CloudError> {
        self.call(
            format!("delete_load_balancer_service {} {}", load_balancer_id, service_id),
            |s| {
                let lb = s.load_balancer_mut(load_balancer_id)?;
                if !lb.services.iter().any(|l| l.id == service_id) {
                    return Err(CloudError::NotFound(format!("service {}", service_id)));
                }
                lb.services.retain(|l| l.id != service_id);
                Ok(s.operation(service_id))
            },
        )
    }

    async fn wait_operation(&self, operation: Operation) -> Result<Operation, CloudError> {
        self.call(format!("wait_operation {}", operation.id), |_| {
            match operation.state {
                OperationState::Success => Ok(operation),
                state => Err(CloudError::OperationFailed {
                    id: operation.id.clone(),
                    state: state.to_string(),
                    message: operation.message.clone().unwrap_or_default(),
                }),
            }
        })
    }
}

/// Builds [`FakeCloud`] clients, either a fresh one per credentials or
/// always the same shared instance
pub struct FakeFactory {
    shared: Option<Arc<FakeCloud>>,
    fail: AtomicBool,
}

impl FakeFactory {
    pub fn per_credentials() -> Self {
        Self {
            shared: None,
            fail: AtomicBool::new(false),
        }
    }

    pub fn shared(cloud: Arc<FakeCloud>) -> Self {
        Self {
            shared: Some(cloud),
            fail: AtomicBool::new(false),
        }
    }

    pub fn fail_builds(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl ClientFactory for FakeFactory {
    fn build(&self, credentials: &Credentials) -> Result<Arc<dyn CloudApi>, CloudError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CloudError::Decode("client construction failed".to_string()));
        }
        match &self.shared {
            Some(cloud) => Ok(cloud.clone()),
            None => Ok(Arc::new(
                FakeCloud::new("ch-gva-2").with_api_key(&credentials.api_key),
            )),
        }
    }
}

/// Credential store whose every client is `cloud`
pub fn fake_store(cloud: Arc<FakeCloud>) -> Arc<CredentialStore> {
    Arc::new(
        CredentialStore::new(
            Arc::new(FakeFactory::shared(cloud)),
            Credentials::new("test", "EXOtest", "secret").unwrap(),
        )
        .unwrap(),
    )
}

pub fn make_instance(id: &str, name: &str, ipv4: &str, instance_pool_id: Option<&str>) -> Instance {
    Instance {
        id: id.to_string(),
        name: name.to_string(),
        public_ipv4: Some(ipv4.parse().unwrap()),
        public_ipv6: None,
        zone: "ch-gva-2".to_string(),
        manager: instance_pool_id.map(|id| InstanceManager {
            id: id.to_string(),
            kind: "instance-pool".to_string(),
        }),
        private_network_ids: Vec::new(),
    }
}

pub fn make_node(name: &str, system_uuid: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            node_info: Some(NodeSystemInfo {
                system_uuid: system_uuid.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// NodeList response body
pub fn make_node_list(nodes: &[Node]) -> String {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "NodeList",
        "metadata": {"resourceVersion": "1"},
        "items": nodes
    })
    .to_string()
}

/// Service of type LoadBalancer in namespace "default" exposing the given
/// (port, nodePort) pairs over TCP
pub fn make_service(
    name: &str,
    uid: &str,
    ports: &[(i32, i32)],
    annotations: &[(&str, &str)],
) -> KubeService {
    let annotations: BTreeMap<String, String> = annotations
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    KubeService {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(uid.to_string()),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port, node_port)| ServicePort {
                        port: *port,
                        node_port: Some(*node_port),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

/// PEM encoded CSR for "system:node:node-1" carrying the given SANs
pub fn make_csr_pem(dns_names: &[&str], ip_addresses: &[&str]) -> String {
    let mut params = rcgen::CertificateParams::default();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "system:node:node-1");
    params.subject_alt_names = dns_names
        .iter()
        .map(|name| rcgen::SanType::DnsName(rcgen::Ia5String::try_from(*name).unwrap()))
        .chain(
            ip_addresses
                .iter()
                .map(|ip| rcgen::SanType::IpAddress(ip.parse().unwrap())),
        )
        .collect();

    let key = rcgen::KeyPair::generate().unwrap();
    params.serialize_request(&key).unwrap().pem().unwrap()
}

pub fn make_csr(name: &str, groups: &[&str], pem: &str) -> CertificateSigningRequest {
    CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(pem.as_bytes().to_vec()),
            signer_name: "kubernetes.io/kubelet-serving".to_string(),
            groups: Some(groups.iter().map(|g| g.to_string()).collect()),
            username: Some("system:node:node-1".to_string()),
            usages: Some(vec![
                "digital signature".to_string(),
                "server auth".to_string(),
            ]),
            ..Default::default()
        },
        status: None,
    }
}
