use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{error, info, warn};

use tidepool_common::{AllowedFunctionsPerContainer, Environment, ObjectMeta};
use tidepool_orchestrator::{
    ContainerSpec, Deployment, HttpProbe, ImagePullPolicy, Labels, Orchestrator, Pod, PodTemplate,
    VolumeMount,
};

use crate::controller::ControllerClient;
use crate::fscache::{ExecutorType, FuncSvc, FunctionServiceCache, ObjectRef};
use crate::specialize::{
    target_filename, FetchRequest, FetchType, FunctionLoadRequest, SpecializeClient, FETCHER_PORT,
    RUNTIME_PORT,
};

/// Shared volume paths. The mount path is the contract by which the fetcher
/// delivers the user payload and the runtime loads it; v1 runtimes hard-code
/// it, so changing any of these breaks deployed environments.
pub const SHARED_MOUNT_PATH: &str = "/userfunc";
pub const SHARED_SECRET_PATH: &str = "/secrets";
pub const SHARED_CFGMAP_PATH: &str = "/configs";

pub const EXECUTOR_TYPE_LABEL_VALUE: &str = "poolmgr";

const DEFAULT_FETCHER_IMAGE: &str = "fission/fetcher";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub fetcher_image: String,
    pub fetcher_image_pull_policy: ImagePullPolicy,
    pub runtime_image_pull_policy: ImagePullPolicy,
    /// Create a ClusterIP service per specialized function instead of
    /// returning the pod IP. Trades cold-start latency for routing
    /// stability; off by default.
    pub use_service: bool,
    pub pod_ready_timeout: Duration,
    /// How long a failed-specialization pod is kept around for inspection
    /// before deletion.
    pub deferred_delete_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            fetcher_image: DEFAULT_FETCHER_IMAGE.to_string(),
            fetcher_image_pull_policy: ImagePullPolicy::IfNotPresent,
            runtime_image_pull_policy: ImagePullPolicy::IfNotPresent,
            use_service: false,
            pod_ready_timeout: Duration::from_secs(300),
            deferred_delete_delay: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(image) = std::env::var("FETCHER_IMAGE") {
            if !image.is_empty() {
                config.fetcher_image = image;
            }
        }
        if let Ok(policy) = std::env::var("FETCHER_IMAGE_PULL_POLICY") {
            config.fetcher_image_pull_policy = ImagePullPolicy::parse(&policy);
        }
        if let Ok(policy) = std::env::var("RUNTIME_IMAGE_PULL_POLICY") {
            config.runtime_image_pull_policy = ImagePullPolicy::parse(&policy);
        }
        config
    }
}

struct ChoosePodRequest {
    new_labels: Labels,
    reply: oneshot::Sender<Result<Pod>>,
}

/// One warm pool: a deployment of idle generic pods for a single
/// environment, with serialized pick-and-relabel.
#[derive(Clone)]
pub struct GenericPool {
    inner: Arc<PoolInner>,
    choose_tx: mpsc::Sender<ChoosePodRequest>,
}

struct PoolInner {
    env: Environment,
    namespace: String,
    instance_id: String,
    deployment_name: String,
    pool_labels: Labels,
    config: PoolConfig,
    orchestrator: Arc<dyn Orchestrator>,
    controller: Arc<dyn ControllerClient>,
    fscache: Arc<FunctionServiceCache>,
    specialize: SpecializeClient,
    /// Refreshed by the ready-wait poll; the spec side never changes.
    deployment: RwLock<Deployment>,
}

fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn pool_labels(env: &Environment, instance_id: &str) -> Labels {
    Labels::from([
        ("environmentName".to_string(), env.metadata.name.clone()),
        ("environmentUid".to_string(), env.metadata.uid.clone()),
        ("executorInstanceId".to_string(), instance_id.to_string()),
        (
            "executorType".to_string(),
            EXECUTOR_TYPE_LABEL_VALUE.to_string(),
        ),
    ])
}

fn shared_mounts() -> Vec<VolumeMount> {
    vec![
        VolumeMount {
            volume: "userfunc".to_string(),
            mount_path: SHARED_MOUNT_PATH.to_string(),
        },
        VolumeMount {
            volume: "secrets".to_string(),
            mount_path: SHARED_SECRET_PATH.to_string(),
        },
        VolumeMount {
            volume: "configs".to_string(),
            mount_path: SHARED_CFGMAP_PATH.to_string(),
        },
    ]
}

fn build_deployment(
    env: &Environment,
    replicas: i32,
    name: &str,
    labels: &Labels,
    config: &PoolConfig,
) -> Deployment {
    let runtime_container = ContainerSpec {
        name: env.metadata.name.clone(),
        image: env.spec.runtime.image.clone(),
        image_pull_policy: config.runtime_image_pull_policy,
        command: Vec::new(),
        mounts: shared_mounts(),
        resources: env.spec.resources.clone(),
        readiness_probe: None,
        liveness_probe: None,
    };

    let fetcher_container = ContainerSpec {
        name: "fetcher".to_string(),
        image: config.fetcher_image.clone(),
        image_pull_policy: config.fetcher_image_pull_policy,
        command: vec![
            "/fetcher".to_string(),
            "-secret-dir".to_string(),
            SHARED_SECRET_PATH.to_string(),
            "-cfgmap-dir".to_string(),
            SHARED_CFGMAP_PATH.to_string(),
            SHARED_MOUNT_PATH.to_string(),
        ],
        mounts: shared_mounts(),
        resources: Default::default(),
        readiness_probe: Some(HttpProbe {
            path: "/healthz".to_string(),
            port: FETCHER_PORT,
            initial_delay_secs: 1,
            period_secs: 1,
            failure_threshold: Some(30),
        }),
        liveness_probe: Some(HttpProbe {
            path: "/healthz".to_string(),
            port: FETCHER_PORT,
            initial_delay_secs: 35,
            period_secs: 5,
            failure_threshold: None,
        }),
    };

    Deployment {
        name: name.to_string(),
        labels: labels.clone(),
        replicas,
        selector: labels.clone(),
        template: PodTemplate {
            labels: labels.clone(),
            volumes: vec![
                "userfunc".to_string(),
                "secrets".to_string(),
                "configs".to_string(),
            ],
            containers: vec![runtime_container, fetcher_container],
            service_account: Some("fetcher".to_string()),
        },
        available_replicas: 0,
    }
}

impl GenericPool {
    /// Create the backing deployment and start the pick-serializer. Does
    /// not wait for any pod to become ready.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        orchestrator: Arc<dyn Orchestrator>,
        controller: Arc<dyn ControllerClient>,
        env: Environment,
        idle_replicas: i32,
        namespace: &str,
        fscache: Arc<FunctionServiceCache>,
        specialize: SpecializeClient,
        instance_id: &str,
        config: PoolConfig,
    ) -> Result<GenericPool> {
        info!(
            environment = %env.metadata.name,
            uid = %env.metadata.uid,
            replicas = idle_replicas,
            "creating pool for environment"
        );

        let labels = pool_labels(&env, instance_id);
        let deployment_name = format!(
            "{}-{}-{}",
            env.metadata.name,
            env.metadata.uid,
            random_suffix()
        )
        .to_lowercase();

        let deployment = orchestrator
            .create_deployment(
                namespace,
                build_deployment(&env, idle_replicas, &deployment_name, &labels, &config),
            )
            .await
            .with_context(|| format!("failed to create pool deployment {deployment_name}"))?;
        info!(deployment = %deployment_name, environment = %env.metadata.name, "deployment created");

        let inner = Arc::new(PoolInner {
            env,
            namespace: namespace.to_string(),
            instance_id: instance_id.to_string(),
            deployment_name,
            pool_labels: labels,
            config,
            orchestrator,
            controller,
            fscache,
            specialize,
            deployment: RwLock::new(deployment),
        });

        let (choose_tx, choose_rx) = mpsc::channel(16);
        tokio::spawn(Self::choose_pod_service(inner.clone(), choose_rx));

        Ok(GenericPool { inner, choose_tx })
    }

    pub fn environment(&self) -> &Environment {
        &self.inner.env
    }

    pub fn deployment_name(&self) -> &str {
        &self.inner.deployment_name
    }

    fn function_labels(&self, function: &ObjectMeta) -> Labels {
        Labels::from([
            ("functionName".to_string(), function.name.clone()),
            ("functionUid".to_string(), function.uid.clone()),
            // Marks the pod as no longer owned by the pool deployment.
            ("unmanaged".to_string(), "true".to_string()),
            (
                "executorInstanceId".to_string(),
                self.inner.instance_id.clone(),
            ),
        ])
    }

    /// Serializes pod choice so that concurrent picks never relabel the
    /// same pod.
    async fn choose_pod_service(inner: Arc<PoolInner>, mut rx: mpsc::Receiver<ChoosePodRequest>) {
        while let Some(req) = rx.recv().await {
            let result = Self::choose_pod_serialized(&inner, req.new_labels).await;
            let _ = req.reply.send(result);
        }
    }

    /// Pick a ready pod from the pool and relabel it, waiting if necessary.
    async fn choose_pod(&self, new_labels: Labels) -> Result<Pod> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.choose_tx
            .send(ChoosePodRequest {
                new_labels,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("pool is shut down"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("pool is shut down"))?
    }

    async fn choose_pod_serialized(inner: &Arc<PoolInner>, new_labels: Labels) -> Result<Pod> {
        let start = tokio::time::Instant::now();
        loop {
            if start.elapsed() > inner.config.pod_ready_timeout {
                warn!(deployment = %inner.deployment_name, "timed out waiting for a ready pod");
                bail!("timeout: waited too long to get a ready pod");
            }

            let selector = inner.deployment.read().await.selector.clone();
            let pods = inner
                .orchestrator
                .list_pods(&inner.namespace, &selector)
                .await?;
            let ready: Vec<&Pod> = pods.iter().filter(|p| p.is_ready()).collect();
            info!(
                deployment = %inner.deployment_name,
                ready = ready.len(),
                total = pods.len(),
                "pool inventory"
            );

            if ready.is_empty() {
                Self::wait_for_ready_pod(inner).await?;
                continue;
            }

            // Uniform random choice. Node locality would make a better
            // scheduling signal, but the orchestrator doesn't give us one
            // cheaply here.
            let idx = rand::thread_rng().gen_range(0..ready.len());
            let mut chosen = ready[idx].clone();

            if inner.env.spec.allowed_functions_per_container
                != AllowedFunctionsPerContainer::Infinite
            {
                info!(pod = %chosen.name, "relabeling pod");
                let updated = inner
                    .orchestrator
                    .update_pod_labels(&inner.namespace, &chosen, new_labels.clone())
                    .await?;
                if !updated {
                    // Someone else took the pod between list and update.
                    warn!(pod = %chosen.name, "pod changed since listing, retrying");
                    continue;
                }
                chosen.labels = new_labels;
            }

            info!(pod = %chosen.name, elapsed = ?start.elapsed(), "chose pod");
            return Ok(chosen);
        }
    }

    /// Poll the deployment until it reports an available pod.
    async fn wait_for_ready_pod(inner: &Arc<PoolInner>) -> Result<()> {
        let start = tokio::time::Instant::now();
        loop {
            let deployment = inner
                .orchestrator
                .get_deployment(&inner.namespace, &inner.deployment_name)
                .await?;
            let available = deployment.available_replicas;
            *inner.deployment.write().await = deployment;
            if available > 0 {
                return Ok(());
            }

            if start.elapsed() > inner.config.pod_ready_timeout {
                bail!("timeout: waited too long for pod to be ready");
            }
            tokio::time::sleep(Duration::from_millis(1000)).await;
        }
    }

    /// Copy the user package into the pod via the fetcher, then ask the
    /// runtime container to load it.
    async fn specialize_pod(&self, pod: &Pod, function_meta: &ObjectMeta) -> Result<()> {
        let inner = &self.inner;
        let pod_ip = match pod.ip.as_deref() {
            Some(ip) if !ip.is_empty() => ip.to_string(),
            _ => bail!("pod has no IP"),
        };

        let function = inner
            .controller
            .get_function(&function_meta.namespace, &function_meta.name)
            .await?;

        let filename = target_filename(inner.env.spec.version, &function.metadata.uid);

        info!(function = %function_meta.name, pod = %pod.name, "calling fetcher to copy function");
        inner
            .specialize
            .fetch(
                &pod_ip,
                &FetchRequest {
                    fetch_type: FetchType::Deployment,
                    package: function.spec.package.clone(),
                    filename: filename.clone(),
                    secrets: function.spec.secrets.clone(),
                    config_maps: function.spec.config_maps.clone(),
                },
            )
            .await?;

        info!(function = %function_meta.name, pod = %pod.name, "specializing pod");
        inner
            .specialize
            .load(
                &pod_ip,
                inner.env.spec.version,
                &FunctionLoadRequest {
                    file_path: format!("{SHARED_MOUNT_PATH}/{filename}"),
                    function_name: function.spec.entrypoint.clone(),
                    function_metadata: function.metadata.clone(),
                },
            )
            .await
    }

    /// Keep the pod around for a while so operators can pull logs, then
    /// delete it.
    fn schedule_deferred_delete(&self, pod_name: &str) {
        warn!(pod = %pod_name, "error in pod, scheduling cleanup");
        let inner = self.inner.clone();
        let pod_name = pod_name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.deferred_delete_delay).await;
            if let Err(e) = inner
                .orchestrator
                .delete_pod(&inner.namespace, &pod_name)
                .await
            {
                warn!(pod = %pod_name, error = %e, "deferred pod delete failed");
            }
        });
    }

    /// Specialize a pod for the function and return its service descriptor.
    ///
    /// Not idempotent: two concurrent calls for the same function each
    /// consume a pod, and the second cache registration fails. De-dup is
    /// the router's job.
    pub async fn get_func_svc(&self, function_meta: &ObjectMeta) -> Result<FuncSvc> {
        let inner = &self.inner;
        info!(function = %function_meta.name, "choosing pod from pool");

        let new_labels = self.function_labels(function_meta);
        let pod = self.choose_pod(new_labels.clone()).await?;

        if let Err(e) = self.specialize_pod(&pod, function_meta).await {
            self.schedule_deferred_delete(&pod.name);
            return Err(e);
        }
        info!(pod = %pod.name, function = %function_meta.name, "specialized pod");

        let address = if inner.config.use_service {
            let mut svc_name = format!("svc-{}", function_meta.name);
            if !function_meta.uid.is_empty() {
                svc_name = format!("{svc_name}-{}", function_meta.uid);
            }
            let svc = match inner
                .orchestrator
                .create_service(
                    &inner.namespace,
                    &svc_name,
                    new_labels.clone(),
                    80,
                    RUNTIME_PORT,
                )
                .await
            {
                Ok(svc) => svc,
                Err(e) => {
                    self.schedule_deferred_delete(&pod.name);
                    return Err(e);
                }
            };
            if svc.name != svc_name {
                self.schedule_deferred_delete(&pod.name);
                bail!("sanity check failed for service {}", svc.name);
            }
            // The router runs in another namespace; qualify the hostname.
            format!("{svc_name}.{}", inner.namespace)
        } else {
            format!("{}:{RUNTIME_PORT}", pod.ip.as_deref().unwrap_or_default())
        };

        let now = Utc::now();
        let fsvc = FuncSvc {
            name: pod.name.clone(),
            function: function_meta.clone(),
            environment: inner.env.clone(),
            address,
            orchestrator_refs: vec![ObjectRef {
                kind: "pod".to_string(),
                name: pod.name.clone(),
                namespace: pod.namespace.clone(),
                resource_version: pod.resource_version.clone(),
                uid: pod.uid.clone(),
            }],
            executor: ExecutorType::Poolmgr,
            ctime: now,
            atime: now,
        };

        // On registration failure the specialized pod stays alive; the
        // caller may retry the lookup.
        inner.fscache.add(fsvc.clone())?;
        Ok(fsvc)
    }

    /// Tear the pool down: the deployment delete is authoritative; stray
    /// replica sets and pods are swept best-effort for orchestrators that
    /// don't garbage-collect them. Specialized (unmanaged) pods are left
    /// alone; they belong to in-flight functions.
    pub async fn destroy(&self) -> Result<()> {
        let inner = &self.inner;

        inner
            .orchestrator
            .delete_deployment(&inner.namespace, &inner.deployment_name)
            .await
            .with_context(|| {
                format!("failed to destroy pool deployment {}", inner.deployment_name)
            })?;

        match inner
            .orchestrator
            .list_replica_sets(&inner.namespace, &inner.pool_labels)
            .await
        {
            Ok(replica_sets) => {
                for rs in replica_sets {
                    if let Err(e) = inner
                        .orchestrator
                        .delete_replica_set(&inner.namespace, &rs.name)
                        .await
                    {
                        error!(replica_set = %rs.name, error = %e, "error deleting replica set, ignoring");
                    }
                }
            }
            Err(e) => error!(error = %e, "error listing replica sets, ignoring"),
        }

        match inner
            .orchestrator
            .list_pods(&inner.namespace, &inner.pool_labels)
            .await
        {
            Ok(pods) => {
                for pod in pods {
                    if let Err(e) = inner
                        .orchestrator
                        .delete_pod(&inner.namespace, &pod.name)
                        .await
                    {
                        error!(pod = %pod.name, error = %e, "error deleting pod, ignoring");
                    }
                }
            }
            Err(e) => error!(error = %e, "error listing pods, ignoring"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_common::{EnvironmentSpec, RuntimeSpec};

    fn make_env() -> Environment {
        Environment {
            metadata: ObjectMeta::new("default", "Py", "UID-1"),
            spec: EnvironmentSpec {
                version: 2,
                runtime: RuntimeSpec {
                    image: "tidepool/python-env".to_string(),
                },
                ..Default::default()
            },
        }
    }

    #[test]
    fn pool_labels_identify_environment_and_executor() {
        let labels = pool_labels(&make_env(), "inst-1");
        assert_eq!(labels["environmentName"], "Py");
        assert_eq!(labels["environmentUid"], "UID-1");
        assert_eq!(labels["executorInstanceId"], "inst-1");
        assert_eq!(labels["executorType"], "poolmgr");
    }

    #[test]
    fn deployment_carries_runtime_and_fetcher_sidecar() {
        let env = make_env();
        let labels = pool_labels(&env, "inst-1");
        let deployment = build_deployment(&env, 3, "py-uid-1-abcd1234", &labels, &PoolConfig::default());

        assert_eq!(deployment.replicas, 3);
        assert_eq!(deployment.selector, labels);
        assert_eq!(deployment.template.volumes.len(), 3);
        assert_eq!(deployment.template.containers.len(), 2);

        let runtime = &deployment.template.containers[0];
        assert_eq!(runtime.image, "tidepool/python-env");
        assert!(runtime
            .mounts
            .iter()
            .any(|m| m.mount_path == SHARED_MOUNT_PATH));

        let fetcher = &deployment.template.containers[1];
        assert_eq!(fetcher.name, "fetcher");
        assert_eq!(
            fetcher.command,
            vec!["/fetcher", "-secret-dir", "/secrets", "-cfgmap-dir", "/configs", "/userfunc"]
        );
        let readiness = fetcher.readiness_probe.as_ref().unwrap();
        assert_eq!(readiness.port, FETCHER_PORT);
        assert_eq!(readiness.path, "/healthz");
        assert_eq!(readiness.failure_threshold, Some(30));
        let liveness = fetcher.liveness_probe.as_ref().unwrap();
        assert_eq!(liveness.initial_delay_secs, 35);
        assert_eq!(liveness.period_secs, 5);
    }

    #[test]
    fn random_suffix_is_short_lowercase_hex() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(random_suffix(), suffix);
    }
}
