//! End-to-end pool lifecycle tests against the in-memory orchestrator and a
//! fake in-pod sidecar speaking the fetch/specialize protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use tidepool_common::{
    AllowedFunctionsPerContainer, Environment, EnvironmentSpec, Function, FunctionSpec,
    NamespacedName, ObjectMeta, RuntimeSpec,
};
use tidepool_orchestrator::{Labels, MemoryOrchestrator, Orchestrator};

use tidepool_executor::api::{executor_api_router, ApiState};
use tidepool_executor::{
    ControllerClient, FunctionServiceCache, GenericPool, PoolConfig, PoolManager, SpecializeClient,
};

const NAMESPACE: &str = "fn-ns";

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct StubController {
    envs: Arc<RwLock<Vec<Environment>>>,
    functions: Arc<RwLock<HashMap<String, Function>>>,
}

impl StubController {
    async fn set_envs(&self, envs: Vec<Environment>) {
        *self.envs.write().await = envs;
    }

    async fn add_function(&self, function: Function) {
        let key = format!("{}/{}", function.metadata.namespace, function.metadata.name);
        self.functions.write().await.insert(key, function);
    }
}

#[async_trait]
impl ControllerClient for StubController {
    async fn list_environments(&self) -> Result<Vec<Environment>> {
        Ok(self.envs.read().await.clone())
    }

    async fn get_environment(&self, namespace: &str, name: &str) -> Result<Environment> {
        let envs = self.envs.read().await;
        match envs
            .iter()
            .find(|e| e.metadata.namespace == namespace && e.metadata.name == name)
        {
            Some(env) => Ok(env.clone()),
            None => bail!("environment {namespace}/{name} not found"),
        }
    }

    async fn get_function(&self, namespace: &str, name: &str) -> Result<Function> {
        let functions = self.functions.read().await;
        match functions.get(&format!("{namespace}/{name}")) {
            Some(f) => Ok(f.clone()),
            None => bail!("function {namespace}/{name} not found"),
        }
    }
}

#[derive(Debug, Clone)]
struct LoadRecord {
    path: String,
    content_type: String,
    body: String,
}

#[derive(Clone, Default)]
struct SidecarState {
    fetches: Arc<Mutex<Vec<Value>>>,
    loads: Arc<Mutex<Vec<LoadRecord>>>,
}

async fn record_fetch(State(state): State<SidecarState>, Json(body): Json<Value>) -> StatusCode {
    state.fetches.lock().await.push(body);
    StatusCode::OK
}

fn record_load(path: &'static str) -> axum::routing::MethodRouter<SidecarState> {
    post(move |State(state): State<SidecarState>, headers: HeaderMap, body: String| async move {
        state.loads.lock().await.push(LoadRecord {
            path: path.to_string(),
            content_type: headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            body,
        });
        StatusCode::OK
    })
}

/// One fake server plays both in-pod sidecars: the fetcher on `/` and the
/// runtime's specialize endpoints.
async fn start_fake_sidecar() -> (u16, SidecarState) {
    let state = SidecarState::default();
    let app = Router::new()
        .route("/", post(record_fetch))
        .route("/specialize", record_load("/specialize"))
        .route("/v2/specialize", record_load("/v2/specialize"))
        .route("/v3/specialize", record_load("/v3/specialize"))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, state)
}

// ---------------------------------------------------------------------------
// Object constructors
// ---------------------------------------------------------------------------

fn make_env(
    name: &str,
    uid: &str,
    version: u32,
    poolsize: u32,
    allowed: AllowedFunctionsPerContainer,
) -> Environment {
    Environment {
        metadata: ObjectMeta::new("default", name, uid),
        spec: EnvironmentSpec {
            version,
            runtime: RuntimeSpec {
                image: format!("tidepool/{name}-env"),
            },
            allowed_functions_per_container: allowed,
            poolsize,
            ..Default::default()
        },
    }
}

fn make_function(name: &str, uid: &str, env: &Environment) -> Function {
    Function {
        metadata: ObjectMeta::new("default", name, uid),
        spec: FunctionSpec {
            package: NamespacedName::new("default", &format!("{name}-pkg")),
            entrypoint: "handler".to_string(),
            secrets: Vec::new(),
            config_maps: Vec::new(),
            environment: NamespacedName::new(&env.metadata.namespace, &env.metadata.name),
        },
    }
}

fn pool_selector(env: &Environment) -> Labels {
    Labels::from([
        ("environmentName".to_string(), env.metadata.name.clone()),
        ("environmentUid".to_string(), env.metadata.uid.clone()),
        ("executorType".to_string(), "poolmgr".to_string()),
    ])
}

#[allow(clippy::too_many_arguments)]
async fn make_pool(
    orchestrator: Arc<MemoryOrchestrator>,
    controller: Arc<StubController>,
    env: &Environment,
    replicas: i32,
    fscache: Arc<FunctionServiceCache>,
    specialize: SpecializeClient,
    config: PoolConfig,
) -> GenericPool {
    GenericPool::new(
        orchestrator,
        controller,
        env.clone(),
        replicas,
        NAMESPACE,
        fscache,
        specialize,
        "test-instance",
        config,
    )
    .await
    .unwrap()
}

// ---------------------------------------------------------------------------
// Seed scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cold_start_v2_specializes_over_the_wire() {
    let (port, sidecar) = start_fake_sidecar().await;
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    orchestrator.fix_pod_ip("127.0.0.1").await;

    let env = make_env("py", "env-uid", 2, 0, AllowedFunctionsPerContainer::Single);
    let controller = Arc::new(StubController::default());
    let function = make_function("f", "U", &env);
    controller.add_function(function.clone()).await;

    let fscache = Arc::new(FunctionServiceCache::new());
    let pool = make_pool(
        orchestrator.clone(),
        controller,
        &env,
        3,
        fscache.clone(),
        SpecializeClient::new(port, port),
        PoolConfig::default(),
    )
    .await;

    let fsvc = pool.get_func_svc(&function.metadata).await.unwrap();
    assert_eq!(fsvc.address, "127.0.0.1:8888");

    // The fetcher received the per-function filename.
    let fetches = sidecar.fetches.lock().await;
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0]["fetchType"], "deployment");
    assert_eq!(fetches[0]["filename"], "U");
    assert_eq!(fetches[0]["package"]["name"], "f-pkg");

    // The runtime got a v2 load request naming the shared-volume path.
    let loads = sidecar.loads.lock().await;
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].path, "/v2/specialize");
    assert!(loads[0].content_type.starts_with("application/json"));
    let body: Value = serde_json::from_str(&loads[0].body).unwrap();
    assert_eq!(body["filePath"], "/userfunc/U");
    assert_eq!(body["functionName"], "handler");

    // The chosen pod left the pool and now carries the function labels.
    let remaining = orchestrator
        .list_pods(NAMESPACE, &pool_selector(&env))
        .await
        .unwrap();
    assert!(remaining.iter().all(|p| p.name != fsvc.name));
    let function_selector = Labels::from([
        ("functionName".to_string(), "f".to_string()),
        ("functionUid".to_string(), "U".to_string()),
        ("unmanaged".to_string(), "true".to_string()),
    ]);
    let relabeled = orchestrator
        .list_pods(NAMESPACE, &function_selector)
        .await
        .unwrap();
    assert_eq!(relabeled.len(), 1);
    assert_eq!(relabeled[0].name, fsvc.name);

    assert_eq!(fscache.len(), 1);
}

#[tokio::test]
async fn cold_start_v1_uses_legacy_path_and_empty_body() {
    let (port, sidecar) = start_fake_sidecar().await;
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    orchestrator.fix_pod_ip("127.0.0.1").await;

    let env = make_env("node", "env-v1", 1, 0, AllowedFunctionsPerContainer::Single);
    let controller = Arc::new(StubController::default());
    let function = make_function("g", "G-uid", &env);
    controller.add_function(function.clone()).await;

    let pool = make_pool(
        orchestrator,
        controller,
        &env,
        3,
        Arc::new(FunctionServiceCache::new()),
        SpecializeClient::new(port, port),
        PoolConfig::default(),
    )
    .await;

    pool.get_func_svc(&function.metadata).await.unwrap();

    let fetches = sidecar.fetches.lock().await;
    assert_eq!(fetches[0]["filename"], "user");

    let loads = sidecar.loads.lock().await;
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].path, "/specialize");
    assert!(loads[0].content_type.starts_with("text/plain"));
    assert!(loads[0].body.is_empty());
}

#[tokio::test]
async fn shared_container_reuses_one_pod_without_relabeling() {
    let (port, _sidecar) = start_fake_sidecar().await;
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    orchestrator.fix_pod_ip("127.0.0.1").await;

    let env = make_env("tsc", "env-inf", 3, 1, AllowedFunctionsPerContainer::Infinite);
    let controller = Arc::new(StubController::default());
    let f1 = make_function("alpha", "a-uid", &env);
    let f2 = make_function("beta", "b-uid", &env);
    controller.add_function(f1.clone()).await;
    controller.add_function(f2.clone()).await;

    let pool = make_pool(
        orchestrator.clone(),
        controller,
        &env,
        1,
        Arc::new(FunctionServiceCache::new()),
        SpecializeClient::new(port, port),
        PoolConfig::default(),
    )
    .await;

    let svc1 = pool.get_func_svc(&f1.metadata).await.unwrap();
    let svc2 = pool.get_func_svc(&f2.metadata).await.unwrap();

    assert_eq!(svc1.name, svc2.name, "both functions share the single pod");

    // No relabel happened: the pod is still selected by the pool labels.
    let pods = orchestrator
        .list_pods(NAMESPACE, &pool_selector(&env))
        .await
        .unwrap();
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].name, svc1.name);
}

#[tokio::test]
async fn concurrent_picks_consume_distinct_pods() {
    let (port, _sidecar) = start_fake_sidecar().await;
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    orchestrator.fix_pod_ip("127.0.0.1").await;

    let env = make_env("go", "env-go", 2, 0, AllowedFunctionsPerContainer::Single);
    let controller = Arc::new(StubController::default());
    let f1 = make_function("one", "uid-one", &env);
    let f2 = make_function("two", "uid-two", &env);
    controller.add_function(f1.clone()).await;
    controller.add_function(f2.clone()).await;

    let pool = make_pool(
        orchestrator.clone(),
        controller,
        &env,
        3,
        Arc::new(FunctionServiceCache::new()),
        SpecializeClient::new(port, port),
        PoolConfig::default(),
    )
    .await;

    // Replacements spawned from here on start out unready, so the ready
    // set observably shrinks as pods are taken.
    orchestrator.set_auto_ready(false).await;

    let (r1, r2) = tokio::join!(
        pool.get_func_svc(&f1.metadata),
        pool.get_func_svc(&f2.metadata)
    );
    let (svc1, svc2) = (r1.unwrap(), r2.unwrap());

    assert_ne!(svc1.name, svc2.name, "single-flight picks distinct pods");

    let pods = orchestrator
        .list_pods(NAMESPACE, &pool_selector(&env))
        .await
        .unwrap();
    assert_eq!(pods.len(), 3, "backfill keeps the pool at size");
    let ready = pods.iter().filter(|p| p.is_ready()).count();
    assert_eq!(ready, 1, "the ready set decreased by exactly two");
}

#[tokio::test]
async fn load_retries_through_connect_failures() {
    let (fetcher_port, _sidecar) = start_fake_sidecar().await;
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    orchestrator.fix_pod_ip("127.0.0.1").await;
    orchestrator.set_auto_ready(false).await;

    let env = make_env("rb", "env-rb", 2, 0, AllowedFunctionsPerContainer::Single);
    let controller = Arc::new(StubController::default());
    let function = make_function("slow", "slow-uid", &env);
    controller.add_function(function.clone()).await;

    // Reserve a port with nothing listening on it yet.
    let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let runtime_port = reserved.local_addr().unwrap().port();
    drop(reserved);

    let pool = make_pool(
        orchestrator.clone(),
        controller,
        &env,
        1,
        Arc::new(FunctionServiceCache::new()),
        SpecializeClient::new(fetcher_port, runtime_port),
        PoolConfig::default(),
    )
    .await;
    orchestrator.make_all_ready().await;

    let started = tokio::time::Instant::now();
    let handle = {
        let pool = pool.clone();
        let meta = function.metadata.clone();
        tokio::spawn(async move { pool.get_func_svc(&meta).await })
    };

    // Let a few dial attempts fail, then bring the runtime up.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let app = Router::new().route("/v2/specialize", post(|| async { StatusCode::OK }));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", runtime_port))
        .await
        .unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let fsvc = handle.await.unwrap().unwrap();
    assert_eq!(fsvc.address, "127.0.0.1:8888");
    assert!(
        started.elapsed() >= Duration::from_millis(1500),
        "retries paced out the load call"
    );
}

#[tokio::test]
async fn environment_deletion_tears_down_and_recreates_pools() {
    let (port, _sidecar) = start_fake_sidecar().await;
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    orchestrator.fix_pod_ip("127.0.0.1").await;

    let env = make_env("rs", "env-rs", 3, 2, AllowedFunctionsPerContainer::Single);
    let controller = Arc::new(StubController::default());
    controller.set_envs(vec![env.clone()]).await;

    let manager = PoolManager::new(
        orchestrator.clone(),
        controller.clone(),
        NAMESPACE,
        Arc::new(FunctionServiceCache::new()),
        SpecializeClient::new(port, port),
        "test-instance",
        PoolConfig::default(),
    );

    let pool = manager.get_pool(&env).await.unwrap();
    let first_name = pool.deployment_name().to_string();

    // Same environment resolves to the same pool, not a new deployment.
    let again = manager.get_pool(&env).await.unwrap();
    assert_eq!(again.deployment_name(), first_name);

    // The environment vanishes from the controller listing; within an
    // eager cycle the pool and everything carrying its labels is gone.
    controller.set_envs(Vec::new()).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(orchestrator
        .get_deployment(NAMESPACE, &first_name)
        .await
        .is_err());
    let leftovers = orchestrator
        .list_pods(NAMESPACE, &pool_selector(&env))
        .await
        .unwrap();
    assert!(leftovers.is_empty(), "pool pods were swept on destroy");
    let replica_sets = orchestrator
        .list_replica_sets(NAMESPACE, &pool_selector(&env))
        .await
        .unwrap();
    assert!(replica_sets.is_empty(), "replica sets were swept on destroy");

    // A fresh request recreates the pool under a new name.
    let recreated = manager.get_pool(&env).await.unwrap();
    assert_ne!(recreated.deployment_name(), first_name);
}

#[tokio::test]
async fn service_mode_returns_stable_hostname() {
    let (port, _sidecar) = start_fake_sidecar().await;
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    orchestrator.fix_pod_ip("127.0.0.1").await;

    let env = make_env("sv", "env-sv", 2, 0, AllowedFunctionsPerContainer::Single);
    let controller = Arc::new(StubController::default());
    let function = make_function("hello", "svc-uid", &env);
    controller.add_function(function.clone()).await;

    let config = PoolConfig {
        use_service: true,
        ..Default::default()
    };
    let pool = make_pool(
        orchestrator,
        controller,
        &env,
        2,
        Arc::new(FunctionServiceCache::new()),
        SpecializeClient::new(port, port),
        config,
    )
    .await;

    let fsvc = pool.get_func_svc(&function.metadata).await.unwrap();
    assert_eq!(fsvc.address, "svc-hello-svc-uid.fn-ns");
}

// ---------------------------------------------------------------------------
// Boundary behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ready_wait_times_out_with_frozen_message() {
    let (port, _sidecar) = start_fake_sidecar().await;
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    orchestrator.set_auto_ready(false).await;

    let env = make_env("ml", "env-ml", 2, 0, AllowedFunctionsPerContainer::Single);
    let controller = Arc::new(StubController::default());
    let function = make_function("stuck", "stuck-uid", &env);
    controller.add_function(function.clone()).await;

    let config = PoolConfig {
        pod_ready_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let pool = make_pool(
        orchestrator.clone(),
        controller,
        &env,
        1,
        Arc::new(FunctionServiceCache::new()),
        SpecializeClient::new(port, port),
        config,
    )
    .await;

    // The deployment claims availability but no pod ever reports ready, so
    // the pick loop spins until its own budget expires.
    orchestrator
        .pin_available_replicas(NAMESPACE, pool.deployment_name(), Some(1))
        .await;

    let err = pool.get_func_svc(&function.metadata).await.unwrap_err();
    assert_eq!(err.to_string(), "timeout: waited too long to get a ready pod");
}

#[tokio::test]
async fn only_ready_pods_are_eligible() {
    let (port, _sidecar) = start_fake_sidecar().await;
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    orchestrator.fix_pod_ip("127.0.0.1").await;

    let env = make_env("jv", "env-jv", 2, 0, AllowedFunctionsPerContainer::Single);
    let controller = Arc::new(StubController::default());
    let function = make_function("picky", "picky-uid", &env);
    controller.add_function(function.clone()).await;

    let pool = make_pool(
        orchestrator.clone(),
        controller,
        &env,
        3,
        Arc::new(FunctionServiceCache::new()),
        SpecializeClient::new(port, port),
        PoolConfig::default(),
    )
    .await;

    let pods = orchestrator
        .list_pods(NAMESPACE, &pool_selector(&env))
        .await
        .unwrap();
    orchestrator.set_pod_ready(NAMESPACE, &pods[0].name, false).await;
    orchestrator.set_pod_ready(NAMESPACE, &pods[1].name, false).await;

    let fsvc = pool.get_func_svc(&function.metadata).await.unwrap();
    assert_eq!(fsvc.name, pods[2].name);
}

#[tokio::test]
async fn duplicate_registration_surfaces_and_keeps_the_pod() {
    let (port, _sidecar) = start_fake_sidecar().await;
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    orchestrator.fix_pod_ip("127.0.0.1").await;

    let env = make_env("dup", "env-dup", 2, 0, AllowedFunctionsPerContainer::Single);
    let controller = Arc::new(StubController::default());
    let function = make_function("twice", "twice-uid", &env);
    controller.add_function(function.clone()).await;

    let pool = make_pool(
        orchestrator.clone(),
        controller,
        &env,
        3,
        Arc::new(FunctionServiceCache::new()),
        SpecializeClient::new(port, port),
        PoolConfig::default(),
    )
    .await;

    let first = pool.get_func_svc(&function.metadata).await.unwrap();
    let err = pool.get_func_svc(&function.metadata).await.unwrap_err();
    assert!(err.to_string().contains("already registered"));

    // Both specialized pods are still around; cleanup is the caller's call.
    let function_selector = Labels::from([
        ("functionUid".to_string(), "twice-uid".to_string()),
        ("unmanaged".to_string(), "true".to_string()),
    ]);
    let specialized = orchestrator
        .list_pods(NAMESPACE, &function_selector)
        .await
        .unwrap();
    assert_eq!(specialized.len(), 2);
    assert!(specialized.iter().any(|p| p.name == first.name));
}

// ---------------------------------------------------------------------------
// Executor API surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn api_resolves_functions_and_serves_cache_hits() {
    let (port, sidecar) = start_fake_sidecar().await;
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    orchestrator.fix_pod_ip("127.0.0.1").await;

    let env = make_env("api", "env-api", 2, 0, AllowedFunctionsPerContainer::Single);
    let controller = Arc::new(StubController::default());
    controller.set_envs(vec![env.clone()]).await;
    let function = make_function("hello", "hello-uid", &env);
    controller.add_function(function.clone()).await;

    let fscache = Arc::new(FunctionServiceCache::new());
    let manager = PoolManager::new(
        orchestrator,
        controller.clone(),
        NAMESPACE,
        fscache.clone(),
        SpecializeClient::new(port, port),
        "test-instance",
        PoolConfig::default(),
    );

    let app = executor_api_router(ApiState {
        manager,
        controller,
        fscache,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let http = reqwest::Client::new();
    let url = format!("http://{api_addr}/v2/getServiceForFunction");

    let resp = http
        .post(&url)
        .json(&function.metadata)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let address = resp.text().await.unwrap();
    assert_eq!(address, "127.0.0.1:8888");
    assert_eq!(sidecar.loads.lock().await.len(), 1);

    // Second call is a cache hit: same address, no new specialization.
    let resp = http
        .post(&url)
        .json(&function.metadata)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), address);
    assert_eq!(sidecar.loads.lock().await.len(), 1);
}
