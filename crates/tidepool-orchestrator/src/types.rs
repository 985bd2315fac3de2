use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use tidepool_common::Resources;

/// Label sets are used both as object metadata and as selectors. A selector
/// matches a pod when every selector pair is present in the pod's labels.
pub type Labels = BTreeMap<String, String>;

/// Render a label set as the orchestrator's selector string ("k=v,k2=v2").
pub fn selector_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImagePullPolicy {
    Always,
    Never,
    #[default]
    IfNotPresent,
}

impl ImagePullPolicy {
    /// Lenient parse used for operator-supplied environment variables:
    /// anything unrecognized falls back to `IfNotPresent`.
    pub fn parse(s: &str) -> Self {
        match s {
            "Always" => ImagePullPolicy::Always,
            "Never" => ImagePullPolicy::Never,
            _ => ImagePullPolicy::IfNotPresent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "Always",
            ImagePullPolicy::Never => "Never",
            ImagePullPolicy::IfNotPresent => "IfNotPresent",
        }
    }
}

/// HTTP GET probe against a container port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpProbe {
    pub path: String,
    pub port: u16,
    pub initial_delay_secs: i32,
    pub period_secs: i32,
    pub failure_threshold: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub image_pull_policy: ImagePullPolicy,
    /// Entry command; empty means the image default.
    pub command: Vec<String>,
    pub mounts: Vec<VolumeMount>,
    pub resources: Resources,
    pub readiness_probe: Option<HttpProbe>,
    pub liveness_probe: Option<HttpProbe>,
}

/// Pod template stamped out by a deployment. All volumes are emptyDir,
/// which is the only kind the executor needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodTemplate {
    pub labels: Labels,
    pub volumes: Vec<String>,
    pub containers: Vec<ContainerSpec>,
    pub service_account: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deployment {
    pub name: String,
    pub labels: Labels,
    pub replicas: i32,
    pub selector: Labels,
    pub template: PodTemplate,
    /// Status, populated on reads.
    pub available_replicas: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: Labels,
    /// Opaque concurrency token; label updates against a stale version are
    /// rejected by the orchestrator.
    pub resource_version: String,
    pub ip: Option<String>,
    pub phase: PodPhase,
    /// One entry per container, in template order.
    pub container_ready: Vec<bool>,
}

impl Pod {
    /// A pod is eligible for selection only when it is running, routable
    /// and every container reports ready.
    pub fn is_ready(&self) -> bool {
        self.phase == PodPhase::Running
            && self.ip.as_deref().is_some_and(|ip| !ip.is_empty())
            && !self.container_ready.is_empty()
            && self.container_ready.iter().all(|r| *r)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSet {
    pub name: String,
    pub labels: Labels,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Service {
    pub name: String,
}

/// The slice of the orchestrator API the executor touches. The orchestrator
/// is the source of truth for pod state; nothing here is cached.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn create_deployment(&self, namespace: &str, deployment: Deployment)
        -> Result<Deployment>;
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>>;

    /// Replace a pod's label set. Returns `Ok(false)` when the pod moved on
    /// since it was listed (stale resource version); the caller re-lists and
    /// retries. Any other failure is an error.
    async fn update_pod_labels(&self, namespace: &str, pod: &Pod, labels: Labels) -> Result<bool>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_replica_sets(&self, namespace: &str, selector: &Labels)
        -> Result<Vec<ReplicaSet>>;
    async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_service(
        &self,
        namespace: &str,
        name: &str,
        selector: Labels,
        port: u16,
        target_port: u16,
    ) -> Result<Service>;
}
