use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use tidepool_common::telemetry::{self, OtlpConfig};
use tidepool_orchestrator::{KubeOrchestrator, Orchestrator};

use tidepool_executor::api::{executor_api_router, ApiState};
use tidepool_executor::{
    ControllerClient, FunctionServiceCache, HttpControllerClient, PoolConfig, PoolManager,
    SpecializeClient,
};

#[derive(Debug, Parser)]
struct Args {
    /// Namespace the pools and specialized pods live in.
    #[arg(long, default_value = "tidepool-function")]
    namespace: String,

    #[arg(long, default_value = "http://controller")]
    controller_url: String,

    /// Port for the executor's own API.
    #[arg(long, default_value_t = 8888)]
    port: u16,

    /// Create a ClusterIP service per specialized function instead of
    /// returning pod IPs.
    #[arg(long, default_value_t = false)]
    use_service: bool,

    #[arg(long)]
    otlp_endpoint: Option<String>,

    #[arg(long)]
    otlp_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let provider = telemetry::init_tracing(
        "tidepool-executor",
        args.otlp_endpoint.clone().map(|endpoint| OtlpConfig {
            endpoint,
            token: args.otlp_token.clone(),
        }),
    );

    let instance_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    info!(%instance_id, namespace = %args.namespace, "tidepool executor starting");

    let orchestrator: Arc<dyn Orchestrator> = Arc::new(KubeOrchestrator::try_default().await?);
    let controller: Arc<dyn ControllerClient> =
        Arc::new(HttpControllerClient::new(&args.controller_url));
    let fscache = Arc::new(FunctionServiceCache::new());

    let mut config = PoolConfig::from_env();
    config.use_service = args.use_service;

    let manager = PoolManager::new(
        orchestrator,
        controller.clone(),
        &args.namespace,
        fscache.clone(),
        SpecializeClient::from_env(),
        &instance_id,
        config,
    );

    let app = executor_api_router(ApiState {
        manager,
        controller,
        fscache,
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(port = args.port, "serving executor API");
    axum::serve(listener, app).await?;

    if let Some(provider) = provider {
        let _ = provider.shutdown();
    }
    Ok(())
}
