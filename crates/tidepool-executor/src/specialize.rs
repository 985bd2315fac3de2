use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::warn;

use tidepool_common::{NamespacedName, ObjectMeta};

/// In-pod ports. Frozen by deployed fetcher/runtime images.
pub const FETCHER_PORT: u16 = 8000;
pub const RUNTIME_PORT: u16 = 8888;

const MAX_LOAD_ATTEMPTS: u32 = 20;

/// The runtime needs a moment to become routable through a freshly created
/// test service; only taken when the fetcher URL override is set.
const TEST_ROUTABILITY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchType {
    Deployment,
}

/// Body POSTed to the in-pod fetcher, which downloads the package into the
/// shared volume.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub fetch_type: FetchType,
    pub package: NamespacedName,
    pub filename: String,
    pub secrets: Vec<NamespacedName>,
    pub config_maps: Vec<NamespacedName>,
}

/// Body POSTed to a v2+ runtime asking it to load the user entry point.
/// v1 runtimes take no body; they load a hard-coded path.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionLoadRequest {
    pub file_path: String,
    pub function_name: String,
    pub function_metadata: ObjectMeta,
}

/// File name the fetcher writes into the shared volume. v1 runtimes load
/// the hard-coded `user`; later runtimes get a per-function name.
pub fn target_filename(env_version: u32, function_uid: &str) -> String {
    if env_version == 1 {
        "user".to_string()
    } else {
        function_uid.to_string()
    }
}

fn host(pod_ip: &str) -> String {
    // IPv6 literals need brackets in URLs.
    if pod_ip.contains(':') {
        format!("[{pod_ip}]")
    } else {
        pod_ip.to_string()
    }
}

/// HTTP client for the two-phase specialization protocol against the
/// sidecars of a chosen pod.
#[derive(Debug, Clone)]
pub struct SpecializeClient {
    http: reqwest::Client,
    fetcher_port: u16,
    runtime_port: u16,
    fetcher_url_override: Option<String>,
    specialize_url_override: Option<String>,
}

impl Default for SpecializeClient {
    fn default() -> Self {
        Self::new(FETCHER_PORT, RUNTIME_PORT)
    }
}

impl SpecializeClient {
    pub fn new(fetcher_port: u16, runtime_port: u16) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            http,
            fetcher_port,
            runtime_port,
            fetcher_url_override: None,
            specialize_url_override: None,
        }
    }

    /// Production construction: standard ports, with the test-only URL
    /// overrides honored when set in the process environment.
    pub fn from_env() -> Self {
        let mut client = Self::default();
        client.fetcher_url_override = std::env::var("TEST_FETCHER_URL").ok().filter(|u| !u.is_empty());
        client.specialize_url_override =
            std::env::var("TEST_SPECIALIZE_URL").ok().filter(|u| !u.is_empty());
        client
    }

    pub fn with_overrides(
        mut self,
        fetcher_url: Option<String>,
        specialize_url: Option<String>,
    ) -> Self {
        self.fetcher_url_override = fetcher_url;
        self.specialize_url_override = specialize_url;
        self
    }

    fn fetcher_url(&self, pod_ip: &str) -> String {
        match &self.fetcher_url_override {
            Some(url) => url.clone(),
            None => format!("http://{}:{}/", host(pod_ip), self.fetcher_port),
        }
    }

    fn specialize_url(&self, pod_ip: &str, env_version: u32) -> String {
        if let Some(url) = &self.specialize_url_override {
            return url.clone();
        }
        let base = format!("http://{}:{}", host(pod_ip), self.runtime_port);
        if env_version == 1 {
            format!("{base}/specialize")
        } else {
            format!("{base}/v{env_version}/specialize")
        }
    }

    /// Phase 1: ask the fetcher to copy the user package into the shared
    /// volume.
    pub async fn fetch(&self, pod_ip: &str, req: &FetchRequest) -> Result<()> {
        if self.fetcher_url_override.is_some() {
            tokio::time::sleep(TEST_ROUTABILITY_DELAY).await;
        }
        let url = self.fetcher_url(pod_ip);
        let resp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .context("fetch request failed")?;
        let status = resp.status();
        if status.as_u16() >= 300 {
            let body = resp.text().await.unwrap_or_default();
            bail!("fetcher returned {status}: {body}");
        }
        Ok(())
    }

    /// Phase 2: ask the runtime container to load the entry point.
    ///
    /// The runtime server may still be coming up, so connect failures are
    /// retried with a growing pause; anything else is terminal.
    pub async fn load(&self, pod_ip: &str, env_version: u32, req: &FunctionLoadRequest) -> Result<()> {
        let url = self.specialize_url(pod_ip, env_version);

        for attempt in 0..MAX_LOAD_ATTEMPTS {
            let result = if env_version >= 2 {
                self.http.post(&url).json(req).send().await
            } else {
                self.http
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, "text/plain")
                    .body(Vec::new())
                    .send()
                    .await
            };

            match result {
                Ok(resp) if resp.status().as_u16() < 300 => return Ok(()),
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    bail!("runtime specialize returned {status}: {body}");
                }
                Err(e) if e.is_connect() && attempt < MAX_LOAD_ATTEMPTS - 1 => {
                    tokio::time::sleep(Duration::from_millis(500 * (2 * attempt) as u64)).await;
                    warn!(error = %e, attempt, "error connecting to pod, retrying");
                }
                Err(e) => {
                    return Err(anyhow::Error::from(e).context("runtime specialize request failed"))
                }
            }
        }
        bail!("runtime specialize did not succeed after {MAX_LOAD_ATTEMPTS} attempts")
    }
}
