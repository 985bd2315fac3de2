use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use tidepool_common::{AllowedFunctionsPerContainer, Environment};
use tidepool_orchestrator::Orchestrator;

use crate::controller::ControllerClient;
use crate::fscache::FunctionServiceCache;
use crate::pool::{GenericPool, PoolConfig};
use crate::specialize::SpecializeClient;

const EAGER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Environments that predate the explicit poolsize field get a fixed
/// legacy size.
fn env_poolsize(env: &Environment) -> i32 {
    if env.spec.version < 3 {
        3
    } else {
        env.spec.poolsize as i32
    }
}

enum PoolRequest {
    GetPool {
        env: Environment,
        reply: oneshot::Sender<Result<GenericPool>>,
    },
    CleanupPools {
        envs: Vec<Environment>,
    },
}

struct ManagerDeps {
    orchestrator: Arc<dyn Orchestrator>,
    controller: Arc<dyn ControllerClient>,
    namespace: String,
    fscache: Arc<FunctionServiceCache>,
    specialize: SpecializeClient,
    instance_id: String,
    config: PoolConfig,
}

/// Owns the environment → pool mapping. Pool creation and reconciliation
/// are linearized through a single server task; callers talk to it through
/// this cheap handle.
#[derive(Clone)]
pub struct PoolManager {
    tx: mpsc::Sender<PoolRequest>,
}

impl PoolManager {
    /// Start the request server and the eager pool creator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        controller: Arc<dyn ControllerClient>,
        namespace: &str,
        fscache: Arc<FunctionServiceCache>,
        specialize: SpecializeClient,
        instance_id: &str,
        config: PoolConfig,
    ) -> PoolManager {
        let deps = Arc::new(ManagerDeps {
            orchestrator,
            controller: controller.clone(),
            namespace: namespace.to_string(),
            fscache,
            specialize,
            instance_id: instance_id.to_string(),
            config,
        });

        let (tx, rx) = mpsc::channel(16);
        let manager = PoolManager { tx };

        tokio::spawn(Self::service(deps, rx));
        tokio::spawn(Self::eager_pool_creator(manager.clone(), controller));

        manager
    }

    /// Return the pool for the environment, creating it on first request.
    /// Serial execution in the server guarantees concurrent first calls
    /// construct exactly one pool.
    pub async fn get_pool(&self, env: &Environment) -> Result<GenericPool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PoolRequest::GetPool {
                env: env.clone(),
                reply: reply_tx,
            })
            .await
            .context("pool manager is shut down")?;
        reply_rx.await.context("pool manager is shut down")?
    }

    /// Destroy pools whose environment disappeared or whose declared pool
    /// size dropped to zero. Fire and forget.
    pub async fn cleanup_pools(&self, envs: Vec<Environment>) -> Result<()> {
        self.tx
            .send(PoolRequest::CleanupPools { envs })
            .await
            .context("pool manager is shut down")
    }

    async fn service(deps: Arc<ManagerDeps>, mut rx: mpsc::Receiver<PoolRequest>) {
        let mut pools: HashMap<String, GenericPool> = HashMap::new();

        while let Some(req) = rx.recv().await {
            match req {
                PoolRequest::GetPool { env, reply } => {
                    let key = env.metadata.cache_key();
                    if let Some(pool) = pools.get(&key) {
                        let _ = reply.send(Ok(pool.clone()));
                        continue;
                    }

                    let poolsize = match env.spec.allowed_functions_per_container {
                        AllowedFunctionsPerContainer::Infinite => 1,
                        AllowedFunctionsPerContainer::Single => env_poolsize(&env),
                    };

                    let result = GenericPool::new(
                        deps.orchestrator.clone(),
                        deps.controller.clone(),
                        env,
                        poolsize,
                        &deps.namespace,
                        deps.fscache.clone(),
                        deps.specialize.clone(),
                        &deps.instance_id,
                        deps.config.clone(),
                    )
                    .await;

                    let _ = match result {
                        Ok(pool) => {
                            pools.insert(key, pool.clone());
                            reply.send(Ok(pool))
                        }
                        Err(e) => reply.send(Err(e)),
                    };
                }
                PoolRequest::CleanupPools { envs } => {
                    let latest: HashMap<String, i32> = envs
                        .iter()
                        .map(|env| (env.metadata.cache_key(), env_poolsize(env)))
                        .collect();

                    pools.retain(|key, pool| {
                        let keep = matches!(latest.get(key), Some(&size) if size > 0);
                        if !keep {
                            // Env no longer exists or its pool size dropped
                            // to zero; delete asynchronously so reconcile
                            // never blocks on orchestrator deletes.
                            info!(env = %key, "destroying generic pool");
                            let pool = pool.clone();
                            tokio::spawn(async move {
                                if let Err(e) = pool.destroy().await {
                                    error!(error = %e, "failed to destroy pool");
                                }
                            });
                        }
                        keep
                    });
                }
            }
        }
    }

    /// Pre-warm pools for every known environment so the first real
    /// request is fast, then reconcile away pools for deleted
    /// environments.
    async fn eager_pool_creator(manager: PoolManager, controller: Arc<dyn ControllerClient>) {
        loop {
            tokio::time::sleep(EAGER_POLL_INTERVAL).await;

            let envs = match controller.list_environments().await {
                Ok(envs) => envs,
                Err(e) => {
                    // Without the environment list we can't reconcile;
                    // exit and let the orchestrator restart us from a
                    // clean slate.
                    error!(error = %e, "failed to list environments");
                    std::process::exit(1);
                }
            };

            for env in &envs {
                if env_poolsize(env) > 0 {
                    if let Err(e) = manager.get_pool(env).await {
                        error!(env = %env.metadata.name, error = %e, "eager pool create failed");
                    }
                }
            }

            if manager.cleanup_pools(envs).await.is_err() {
                return;
            }
        }
    }
}
