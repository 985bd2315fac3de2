use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;

use tidepool_common::{Environment, Function};

/// Read side of the controller's CRUD surface. The executor only ever
/// lists environments and resolves individual objects.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn list_environments(&self) -> Result<Vec<Environment>>;
    async fn get_environment(&self, namespace: &str, name: &str) -> Result<Environment>;
    async fn get_function(&self, namespace: &str, name: &str) -> Result<Function>;
}

pub struct HttpControllerClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpControllerClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("controller request failed: {path}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("controller returned {status} for {path}");
        }
        resp.json()
            .await
            .with_context(|| format!("failed to decode controller response: {path}"))
    }
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn list_environments(&self) -> Result<Vec<Environment>> {
        self.get_json("/v2/environments").await
    }

    async fn get_environment(&self, namespace: &str, name: &str) -> Result<Environment> {
        self.get_json(&format!("/v2/environments/{namespace}/{name}")).await
    }

    async fn get_function(&self, namespace: &str, name: &str) -> Result<Function> {
        self.get_json(&format!("/v2/functions/{namespace}/{name}")).await
    }
}
