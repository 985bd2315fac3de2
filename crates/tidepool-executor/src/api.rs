use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::error;

use tidepool_common::ObjectMeta;

use crate::controller::ControllerClient;
use crate::fscache::FunctionServiceCache;
use crate::manager::PoolManager;

/// State behind the executor's own API, consumed by the router.
#[derive(Clone)]
pub struct ApiState {
    pub manager: PoolManager,
    pub controller: Arc<dyn ControllerClient>,
    pub fscache: Arc<FunctionServiceCache>,
}

pub fn executor_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v2/getServiceForFunction", post(get_service_for_function))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Resolve a function to a live endpoint address: cache hit returns the
/// registered address; a miss specializes a pod out of the environment's
/// pool.
async fn get_service_for_function(
    State(state): State<ApiState>,
    Json(function_meta): Json<ObjectMeta>,
) -> Response {
    if let Some(fsvc) = state.fscache.get(&function_meta) {
        return (StatusCode::OK, fsvc.address).into_response();
    }

    let result = async {
        let function = state
            .controller
            .get_function(&function_meta.namespace, &function_meta.name)
            .await?;
        let env_ref = &function.spec.environment;
        let env = state
            .controller
            .get_environment(&env_ref.namespace, &env_ref.name)
            .await?;
        let pool = state.manager.get_pool(&env).await?;
        let fsvc = pool.get_func_svc(&function_meta).await?;
        anyhow::Ok(fsvc.address)
    }
    .await;

    match result {
        Ok(address) => (StatusCode::OK, address).into_response(),
        Err(e) => {
            error!(function = %function_meta.name, error = %e, "failed to get service for function");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
