// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes cluster runtime.
//!
//! A minimal client for the core/v1 pods API. Every sandbox runs as one pod
//! named `sandbox-<id>` labelled `app=liteboxd` and `sandbox-id=<id>`, with a
//! single container called `main`. Lookups always go through the label
//! selector.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::traits::*;
use crate::config::Config;

/// Default CPU limit when the sandbox spec leaves it empty.
pub const DEFAULT_CPU_LIMIT: &str = "500m";
/// Default memory limit when the sandbox spec leaves it empty.
pub const DEFAULT_MEMORY_LIMIT: &str = "512Mi";

const TTL_ANNOTATION: &str = "liteboxd.io/ttl";
const CONTAINER_NAME: &str = "main";
const SANDBOX_UID: i64 = 1000;

/// Connection settings for [`KubeCluster`].
#[derive(Debug, Clone)]
pub struct KubeClusterConfig {
    /// API server base URL
    pub api_url: String,
    /// Namespace holding sandbox pods
    pub namespace: String,
    /// Bearer token, if any
    pub token: Option<String>,
    /// Extra root certificate (PEM) for the API server
    pub ca_pem: Option<Vec<u8>>,
    /// Skip TLS verification entirely
    pub insecure: bool,
    /// Per-request timeout at the transport layer
    pub timeout: Duration,
}

/// Kubernetes-backed cluster runtime.
pub struct KubeCluster {
    client: reqwest::Client,
    api_url: String,
    namespace: String,
    token: Option<String>,
}

impl KubeCluster {
    /// Create a client from explicit settings.
    pub fn new(config: KubeClusterConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);

        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        } else if let Some(pem) = &config.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| ClusterError::Unavailable(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| ClusterError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            namespace: config.namespace,
            token: config.token,
        })
    }

    /// Create a client from the process configuration.
    ///
    /// Reads the bearer token from `kube_token_path` and, next to it, the
    /// service-account `ca.crt` when present.
    pub fn from_config(config: &Config) -> Result<Self> {
        let token = match std::fs::read_to_string(&config.kube_token_path) {
            Ok(t) => Some(t.trim().to_string()),
            Err(e) => {
                warn!(
                    path = %config.kube_token_path.display(),
                    error = %e,
                    "No cluster token found, using unauthenticated requests"
                );
                None
            }
        };

        let ca_pem = config
            .kube_token_path
            .parent()
            .map(|dir| dir.join("ca.crt"))
            .filter(|p| p.exists())
            .and_then(|p| read_optional(&p));

        Self::new(KubeClusterConfig {
            api_url: config.kube_api_url.clone(),
            namespace: config.namespace.clone(),
            token,
            ca_pem,
            insecure: config.kube_insecure,
            timeout: config.request_timeout,
        })
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.api_url, self.namespace)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn list_by_selector(&self, selector: &str) -> Result<Vec<Workload>> {
        let response = self
            .request(reqwest::Method::GET, self.pods_url())
            .query(&[("labelSelector", selector)])
            .send()
            .await
            .map_err(transport_error)?;

        let body = check_status(response, selector).await?;
        let list: PodList =
            serde_json::from_str(&body).map_err(|e| ClusterError::Decode(e.to_string()))?;

        Ok(list.items.into_iter().filter_map(pod_to_workload).collect())
    }
}

fn read_optional(path: &Path) -> Option<Vec<u8>> {
    std::fs::read(path).ok()
}

fn transport_error(e: reqwest::Error) -> ClusterError {
    if e.is_timeout() {
        ClusterError::Timeout
    } else {
        ClusterError::Unavailable(e.to_string())
    }
}

async fn check_status(response: reqwest::Response, subject: &str) -> Result<String> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;

    match status {
        s if s.is_success() => Ok(body),
        StatusCode::NOT_FOUND => Err(ClusterError::NotFound(subject.to_string())),
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::FORBIDDEN => {
            Err(ClusterError::Rejected(api_message(&body)))
        }
        s => Err(ClusterError::Api {
            status: s.as_u16(),
            message: api_message(&body),
        }),
    }
}

/// Pull `message` out of a Kubernetes `Status` body, falling back to the raw text.
fn api_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMeta,
    #[serde(default)]
    status: Option<PodStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uid: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    deletion_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(rename = "podIP", default)]
    pod_ip: Option<String>,
}

/// Convert a pod into a workload. Pods without a `sandbox-id` label are skipped.
fn pod_to_workload(pod: Pod) -> Option<Workload> {
    let sandbox_id = pod.metadata.labels.get(SANDBOX_ID_LABEL)?.clone();
    let status = pod.status.unwrap_or(PodStatus {
        phase: None,
        pod_ip: None,
    });

    Some(Workload {
        sandbox_id,
        name: pod.metadata.name,
        uid: pod.metadata.uid,
        // The API server fills in the phase asynchronously; a pod without one is still pending.
        phase: status.phase.unwrap_or_else(|| "Pending".to_string()),
        ip: status.pod_ip.unwrap_or_default(),
        terminating: pod.metadata.deletion_timestamp.is_some(),
    })
}

/// Build the pod manifest for a sandbox.
fn pod_manifest(spec: &WorkloadSpec, namespace: &str) -> Value {
    let cpu = if spec.cpu.is_empty() {
        DEFAULT_CPU_LIMIT
    } else {
        &spec.cpu
    };
    let memory = if spec.memory.is_empty() {
        DEFAULT_MEMORY_LIMIT
    } else {
        &spec.memory
    };
    let env: Vec<Value> = spec
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": workload_name(&spec.sandbox_id),
            "namespace": namespace,
            "labels": {
                APP_LABEL: APP_LABEL_VALUE,
                SANDBOX_ID_LABEL: spec.sandbox_id,
            },
            "annotations": {
                TTL_ANNOTATION: spec.ttl_seconds.to_string(),
            },
        },
        "spec": {
            "restartPolicy": "Never",
            "securityContext": {
                "seccompProfile": { "type": "RuntimeDefault" }
            },
            "containers": [{
                "name": CONTAINER_NAME,
                "image": spec.image,
                "imagePullPolicy": "IfNotPresent",
                "command": ["sleep", "infinity"],
                "env": env,
                "resources": {
                    "limits": { "cpu": cpu, "memory": memory },
                    "requests": { "cpu": "100m", "memory": "128Mi" },
                },
                "securityContext": {
                    "allowPrivilegeEscalation": false,
                    "runAsNonRoot": true,
                    "runAsUser": SANDBOX_UID,
                },
                "volumeMounts": [{ "name": "workspace", "mountPath": "/workspace" }],
            }],
            "volumes": [{ "name": "workspace", "emptyDir": {} }],
        },
    })
}

#[async_trait]
impl ClusterRuntime for KubeCluster {
    fn runtime_type(&self) -> &'static str {
        "kubernetes"
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<Workload> {
        let manifest = pod_manifest(spec, &self.namespace);

        let response = self
            .request(reqwest::Method::POST, self.pods_url())
            .json(&manifest)
            .send()
            .await
            .map_err(transport_error)?;

        let body = check_status(response, &spec.sandbox_id).await?;
        let pod: Pod = serde_json::from_str(&body).map_err(|e| ClusterError::Decode(e.to_string()))?;

        debug!(sandbox_id = %spec.sandbox_id, pod = %pod.metadata.name, "Pod created");

        pod_to_workload(pod)
            .ok_or_else(|| ClusterError::Decode("created pod is missing its sandbox-id label".into()))
    }

    async fn get_workload(&self, sandbox_id: &str) -> Result<Workload> {
        let selector = format!("{}={}", SANDBOX_ID_LABEL, sandbox_id);
        self.list_by_selector(&selector)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::NotFound(sandbox_id.to_string()))
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>> {
        let selector = format!("{}={}", APP_LABEL, APP_LABEL_VALUE);
        self.list_by_selector(&selector).await
    }

    async fn delete_workload(&self, sandbox_id: &str) -> Result<()> {
        let workload = self.get_workload(sandbox_id).await?;

        let response = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/{}", self.pods_url(), workload.name),
            )
            .send()
            .await
            .map_err(transport_error)?;

        check_status(response, sandbox_id).await.map(|_| ())
    }
}
