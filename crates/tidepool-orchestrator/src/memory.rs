use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{
    Deployment, Labels, Orchestrator, Pod, PodPhase, ReplicaSet, Service,
};

/// In-memory orchestrator used by tests and local development.
///
/// Models the parts of the real control plane the executor relies on:
/// deployments stamp out pods from their template, pods that stop matching
/// their deployment's selector are backfilled by a simulated controller,
/// and label updates against a stale resource version are rejected. Object
/// resource versions come from a single monotonically increasing revision.
#[derive(Debug, Clone, Default)]
pub struct MemoryOrchestrator {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug)]
struct Inner {
    revision: u64,
    pod_seq: u64,
    /// New pods come up running and ready. Defaults on; tests flip it off
    /// to model slow-starting replicas.
    auto_ready: bool,
    /// When set, every new pod gets this IP instead of a synthetic one.
    fixed_pod_ip: Option<String>,
    deployments: HashMap<String, DeploymentRecord>,
    pods: HashMap<String, PodRecord>,
    replica_sets: HashMap<String, ReplicaSetRecord>,
    services: HashMap<String, ServiceRecord>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            revision: 0,
            pod_seq: 0,
            auto_ready: true,
            fixed_pod_ip: None,
            deployments: HashMap::new(),
            pods: HashMap::new(),
            replica_sets: HashMap::new(),
            services: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct DeploymentRecord {
    namespace: String,
    deployment: Deployment,
    pinned_available: Option<i32>,
}

#[derive(Debug)]
struct PodRecord {
    namespace: String,
    pod: Pod,
}

#[derive(Debug)]
struct ReplicaSetRecord {
    namespace: String,
    replica_set: ReplicaSet,
}

#[derive(Debug)]
#[allow(dead_code)]
struct ServiceRecord {
    namespace: String,
    selector: Labels,
    port: u16,
    target_port: u16,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn matches(labels: &Labels, selector: &Labels) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn spawn_pod(&mut self, namespace: &str, deployment_name: &str, template_labels: &Labels, containers: usize) {
        self.pod_seq += 1;
        let seq = self.pod_seq;
        let rv = self.next_revision();
        let ip = self
            .fixed_pod_ip
            .clone()
            .unwrap_or_else(|| format!("10.244.{}.{}", seq / 250, seq % 250 + 1));
        let ready = self.auto_ready;
        let pod = Pod {
            name: format!("{deployment_name}-{seq}"),
            namespace: namespace.to_string(),
            uid: format!("pod-uid-{seq}"),
            labels: template_labels.clone(),
            resource_version: rv.to_string(),
            ip: if ready { Some(ip) } else { None },
            phase: if ready { PodPhase::Running } else { PodPhase::Pending },
            container_ready: vec![ready; containers.max(1)],
        };
        self.pods.insert(
            key(namespace, &pod.name),
            PodRecord {
                namespace: namespace.to_string(),
                pod,
            },
        );
    }

    /// Simulated controller: every deployment keeps `replicas` pods
    /// matching its selector.
    fn backfill(&mut self) {
        let wanted: Vec<(String, String, Labels, Labels, usize, i32)> = self
            .deployments
            .values()
            .map(|rec| {
                (
                    rec.namespace.clone(),
                    rec.deployment.name.clone(),
                    rec.deployment.selector.clone(),
                    rec.deployment.template.labels.clone(),
                    rec.deployment.template.containers.len(),
                    rec.deployment.replicas,
                )
            })
            .collect();
        for (namespace, name, selector, template_labels, containers, replicas) in wanted {
            let current = self
                .pods
                .values()
                .filter(|p| p.namespace == namespace && matches(&p.pod.labels, &selector))
                .count() as i32;
            for _ in current..replicas {
                self.spawn_pod(&namespace, &name, &template_labels, containers);
            }
        }
    }

    fn available_replicas(&self, rec: &DeploymentRecord) -> i32 {
        if let Some(pinned) = rec.pinned_available {
            return pinned;
        }
        self.pods
            .values()
            .filter(|p| {
                p.namespace == rec.namespace
                    && matches(&p.pod.labels, &rec.deployment.selector)
                    && p.pod.is_ready()
            })
            .count() as i32
    }
}

impl MemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_auto_ready(&self, auto_ready: bool) {
        self.inner.write().await.auto_ready = auto_ready;
    }

    /// All new pods get this IP. Tests point it at a local fake server.
    pub async fn fix_pod_ip(&self, ip: &str) {
        self.inner.write().await.fixed_pod_ip = Some(ip.to_string());
    }

    /// Mark every pod running and ready, as the kubelet would once images
    /// are pulled and probes pass. Bumps resource versions.
    pub async fn make_all_ready(&self) {
        let mut inner = self.inner.write().await;
        let fixed = inner.fixed_pod_ip.clone();
        let keys: Vec<String> = inner.pods.keys().cloned().collect();
        for k in keys {
            let rv = inner.next_revision();
            if let Some(rec) = inner.pods.get_mut(&k) {
                rec.pod.phase = PodPhase::Running;
                if rec.pod.ip.is_none() {
                    rec.pod.ip = Some(fixed.clone().unwrap_or_else(|| "10.244.9.9".to_string()));
                }
                for r in rec.pod.container_ready.iter_mut() {
                    *r = true;
                }
                rec.pod.resource_version = rv.to_string();
            }
        }
    }

    pub async fn set_pod_ready(&self, namespace: &str, name: &str, ready: bool) {
        let mut inner = self.inner.write().await;
        let rv = inner.next_revision();
        if let Some(rec) = inner.pods.get_mut(&key(namespace, name)) {
            rec.pod.phase = if ready { PodPhase::Running } else { PodPhase::Pending };
            for r in rec.pod.container_ready.iter_mut() {
                *r = ready;
            }
            rec.pod.resource_version = rv.to_string();
        }
    }

    /// Pin a deployment's reported available replica count regardless of
    /// actual pod state. `None` unpins.
    pub async fn pin_available_replicas(&self, namespace: &str, name: &str, pinned: Option<i32>) {
        let mut inner = self.inner.write().await;
        if let Some(rec) = inner.deployments.get_mut(&key(namespace, name)) {
            rec.pinned_available = pinned;
        }
    }
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: Deployment,
    ) -> Result<Deployment> {
        let mut inner = self.inner.write().await;
        let k = key(namespace, &deployment.name);
        if inner.deployments.contains_key(&k) {
            bail!("deployment {} already exists", deployment.name);
        }

        let rs_rev = inner.next_revision();
        let rs = ReplicaSet {
            name: format!("{}-{:x}", deployment.name, rs_rev),
            labels: deployment.labels.clone(),
        };
        inner.replica_sets.insert(
            key(namespace, &rs.name),
            ReplicaSetRecord {
                namespace: namespace.to_string(),
                replica_set: rs,
            },
        );

        inner.deployments.insert(
            k.clone(),
            DeploymentRecord {
                namespace: namespace.to_string(),
                deployment: deployment.clone(),
                pinned_available: None,
            },
        );
        inner.backfill();

        let available = inner
            .deployments
            .get(&k)
            .map(|rec| inner.available_replicas(rec))
            .unwrap_or(0);
        let mut created = deployment;
        created.available_replicas = available;
        Ok(created)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let inner = self.inner.read().await;
        let Some(rec) = inner.deployments.get(&key(namespace, name)) else {
            bail!("deployment {name} not found");
        };
        let mut deployment = rec.deployment.clone();
        deployment.available_replicas = inner.available_replicas(rec);
        Ok(deployment)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        // Replica sets and pods linger, as on orchestrators that don't
        // garbage-collect them; callers sweep those separately.
        if inner.deployments.remove(&key(namespace, name)).is_none() {
            bail!("deployment {name} not found");
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>> {
        let inner = self.inner.read().await;
        Ok(inner
            .pods
            .values()
            .filter(|p| p.namespace == namespace && matches(&p.pod.labels, selector))
            .map(|p| p.pod.clone())
            .collect())
    }

    async fn update_pod_labels(&self, namespace: &str, pod: &Pod, labels: Labels) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let k = key(namespace, &pod.name);
        let Some(rec) = inner.pods.get(&k) else {
            bail!("pod {} not found", pod.name);
        };
        if rec.pod.resource_version != pod.resource_version {
            return Ok(false);
        }
        let rv = inner.next_revision();
        if let Some(rec) = inner.pods.get_mut(&k) {
            rec.pod.labels = labels;
            rec.pod.resource_version = rv.to_string();
        }
        inner.backfill();
        Ok(true)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.pods.remove(&key(namespace, name)).is_none() {
            bail!("pod {name} not found");
        }
        inner.backfill();
        Ok(())
    }

    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<ReplicaSet>> {
        let inner = self.inner.read().await;
        Ok(inner
            .replica_sets
            .values()
            .filter(|r| r.namespace == namespace && matches(&r.replica_set.labels, selector))
            .map(|r| r.replica_set.clone())
            .collect())
    }

    async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.replica_sets.remove(&key(namespace, name)).is_none() {
            bail!("replica set {name} not found");
        }
        Ok(())
    }

    async fn create_service(
        &self,
        namespace: &str,
        name: &str,
        selector: Labels,
        port: u16,
        target_port: u16,
    ) -> Result<Service> {
        let mut inner = self.inner.write().await;
        let k = key(namespace, name);
        if inner.services.contains_key(&k) {
            bail!("service {name} already exists");
        }
        inner.services.insert(
            k,
            ServiceRecord {
                namespace: namespace.to_string(),
                selector,
                port,
                target_port,
            },
        );
        Ok(Service {
            name: name.to_string(),
        })
    }
}
