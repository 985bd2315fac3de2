use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;

use tidepool_common::Resources;

use crate::types::{
    selector_string, ContainerSpec, Deployment, HttpProbe, Labels, Orchestrator, Pod, PodPhase,
    ReplicaSet, Service,
};

/// Production orchestrator backend speaking to the cluster API server.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    /// Connect using in-cluster config, falling back to the local
    /// kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("failed to build orchestrator client")?;
        Ok(Self { client })
    }

    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<appsv1::Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<corev1::Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn replica_sets(&self, namespace: &str) -> Api<appsv1::ReplicaSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<corev1::Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn quantity_map(m: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if m.is_empty() {
        return None;
    }
    Some(m.iter().map(|(k, v)| (k.clone(), Quantity(v.clone()))).collect())
}

fn to_resource_requirements(r: &Resources) -> Option<corev1::ResourceRequirements> {
    if r.requests.is_empty() && r.limits.is_empty() {
        return None;
    }
    Some(corev1::ResourceRequirements {
        requests: quantity_map(&r.requests),
        limits: quantity_map(&r.limits),
        ..Default::default()
    })
}

fn to_probe(p: &HttpProbe) -> corev1::Probe {
    corev1::Probe {
        http_get: Some(corev1::HTTPGetAction {
            path: Some(p.path.clone()),
            port: IntOrString::Int(p.port as i32),
            ..Default::default()
        }),
        initial_delay_seconds: Some(p.initial_delay_secs),
        period_seconds: Some(p.period_secs),
        failure_threshold: p.failure_threshold,
        ..Default::default()
    }
}

fn to_container(c: &ContainerSpec) -> corev1::Container {
    corev1::Container {
        name: c.name.clone(),
        image: Some(c.image.clone()),
        image_pull_policy: Some(c.image_pull_policy.as_str().to_string()),
        command: if c.command.is_empty() {
            None
        } else {
            Some(c.command.clone())
        },
        volume_mounts: Some(
            c.mounts
                .iter()
                .map(|m| corev1::VolumeMount {
                    name: m.volume.clone(),
                    mount_path: m.mount_path.clone(),
                    ..Default::default()
                })
                .collect(),
        ),
        resources: to_resource_requirements(&c.resources),
        readiness_probe: c.readiness_probe.as_ref().map(to_probe),
        liveness_probe: c.liveness_probe.as_ref().map(to_probe),
        ..Default::default()
    }
}

fn to_k8s_deployment(d: &Deployment) -> appsv1::Deployment {
    appsv1::Deployment {
        metadata: metav1::ObjectMeta {
            name: Some(d.name.clone()),
            labels: Some(d.labels.clone()),
            ..Default::default()
        },
        spec: Some(appsv1::DeploymentSpec {
            replicas: Some(d.replicas),
            selector: metav1::LabelSelector {
                match_labels: Some(d.selector.clone()),
                ..Default::default()
            },
            template: corev1::PodTemplateSpec {
                metadata: Some(metav1::ObjectMeta {
                    labels: Some(d.template.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(corev1::PodSpec {
                    volumes: Some(
                        d.template
                            .volumes
                            .iter()
                            .map(|name| corev1::Volume {
                                name: name.clone(),
                                empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    containers: d.template.containers.iter().map(to_container).collect(),
                    service_account_name: d.template.service_account.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn from_k8s_deployment(d: &Deployment, k: &appsv1::Deployment) -> Deployment {
    let mut out = d.clone();
    out.available_replicas = k
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    out
}

fn from_k8s_pod(p: &corev1::Pod) -> Pod {
    let status = p.status.as_ref();
    Pod {
        name: p.metadata.name.clone().unwrap_or_default(),
        namespace: p.metadata.namespace.clone().unwrap_or_default(),
        uid: p.metadata.uid.clone().unwrap_or_default(),
        labels: p.metadata.labels.clone().unwrap_or_default(),
        resource_version: p.metadata.resource_version.clone().unwrap_or_default(),
        ip: status.and_then(|s| s.pod_ip.clone()),
        phase: status
            .and_then(|s| s.phase.as_deref())
            .map(PodPhase::parse)
            .unwrap_or_default(),
        container_ready: status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|cs| cs.iter().map(|c| c.ready).collect())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: Deployment,
    ) -> Result<Deployment> {
        let created = self
            .deployments(namespace)
            .create(&PostParams::default(), &to_k8s_deployment(&deployment))
            .await
            .with_context(|| format!("failed to create deployment {}", deployment.name))?;
        Ok(from_k8s_deployment(&deployment, &created))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let k = self
            .deployments(namespace)
            .get(name)
            .await
            .with_context(|| format!("failed to get deployment {name}"))?;
        // Reads only feed status back; the spec side is whatever was created.
        let placeholder = Deployment {
            name: name.to_string(),
            labels: k.metadata.labels.clone().unwrap_or_default(),
            replicas: k.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
            selector: k
                .spec
                .as_ref()
                .and_then(|s| s.selector.match_labels.clone())
                .unwrap_or_default(),
            ..Default::default()
        };
        Ok(from_k8s_deployment(&placeholder, &k))
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        self.deployments(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("failed to delete deployment {name}"))?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(&selector_string(selector));
        let pods = self
            .pods(namespace)
            .list(&lp)
            .await
            .context("failed to list pods")?;
        Ok(pods.items.iter().map(from_k8s_pod).collect())
    }

    async fn update_pod_labels(&self, namespace: &str, pod: &Pod, labels: Labels) -> Result<bool> {
        let api = self.pods(namespace);
        let mut current = api
            .get(&pod.name)
            .await
            .with_context(|| format!("failed to get pod {}", pod.name))?;
        if current.metadata.resource_version.as_deref() != Some(pod.resource_version.as_str()) {
            return Ok(false);
        }
        current.metadata.labels = Some(labels);
        current.metadata.managed_fields = None;
        match api.replace(&pod.name, &PostParams::default(), &current).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => bail!("failed to relabel pod {}: {e}", pod.name),
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("failed to delete pod {name}"))?;
        Ok(())
    }

    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<ReplicaSet>> {
        let lp = ListParams::default().labels(&selector_string(selector));
        let list = self
            .replica_sets(namespace)
            .list(&lp)
            .await
            .context("failed to list replica sets")?;
        Ok(list
            .items
            .iter()
            .map(|rs| ReplicaSet {
                name: rs.metadata.name.clone().unwrap_or_default(),
                labels: rs.metadata.labels.clone().unwrap_or_default(),
            })
            .collect())
    }

    async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<()> {
        self.replica_sets(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("failed to delete replica set {name}"))?;
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
        let svc = corev1::Service {
            metadata: metav1::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(corev1::ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(selector),
                ports: Some(vec![corev1::ServicePort {
                    protocol: Some("TCP".to_string()),
                    port: port as i32,
                    target_port: Some(IntOrString::Int(target_port as i32)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .services(namespace)
            .create(&PostParams::default(), &svc)
            .await
            .with_context(|| format!("failed to create service {name}"))?;
        Ok(Service {
            name: created.metadata.name.unwrap_or_default(),
        })
    }
}
