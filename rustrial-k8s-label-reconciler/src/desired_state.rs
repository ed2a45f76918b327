use crate::errors::ControllerError;
use http_body_util::{BodyExt, Full};
use hyper::{
    Request, Uri,
    body::Bytes,
    header::{ACCEPT, CONTENT_TYPE},
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustrial_k8s_label_reconciler_apis::{
    ClusterIdentity, GetResourcePatchesRequest, GetResourcePatchesResponse, ResourcePatch,
};
use std::{future::Future, path::PathBuf};
use tokio::time::{Duration, timeout};

/// The authoritative source of the desired label state.
///
/// Fetching is a pure query: the same patches are returned on every poll until
/// the provider's state changes.
pub(crate) trait DesiredStateProvider: Send + Sync {
    fn fetch(
        &self,
        cluster: &ClusterIdentity,
    ) -> impl Future<Output = Result<Vec<ResourcePatch>, ControllerError>> + Send;
}

/// Queries the fleet admin API via `POST {base}/v1/resourcepatches` (plain HTTP).
pub(crate) struct HttpDesiredStateProvider {
    endpoint: Uri,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpDesiredStateProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ControllerError> {
        let endpoint = format!("{}/v1/resourcepatches", base_url.trim_end_matches('/'))
            .parse::<Uri>()
            .map_err(|e| {
                ControllerError::DesiredState(format!("invalid URL {}: {}", base_url, e))
            })?;
        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self {
            endpoint,
            timeout,
            client,
        })
    }

    fn failed<E: std::fmt::Display>(&self, e: E) -> ControllerError {
        ControllerError::DesiredState(format!("request to {} failed: {}", self.endpoint, e))
    }
}

impl DesiredStateProvider for HttpDesiredStateProvider {
    async fn fetch(&self, cluster: &ClusterIdentity) -> Result<Vec<ResourcePatch>, ControllerError> {
        let body = serde_json::to_vec(&GetResourcePatchesRequest {
            cluster: cluster.clone(),
        })?;
        let request = Request::post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| self.failed(e))?;
        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| self.failed(e))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| self.failed(e))?
                .to_bytes();
            Ok::<_, ControllerError>((status, body))
        };
        let (status, body) = timeout(self.timeout, exchange)
            .await
            .map_err(|_| self.failed(format!("timed out after {:?}", self.timeout)))??;
        if !status.is_success() {
            return Err(self.failed(format!(
                "status {}: {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }
        let response: GetResourcePatchesResponse = serde_json::from_slice(&body)?;
        Ok(response.resource_patches)
    }
}

/// Reads the desired state from a local JSON or YAML document on every poll.
pub(crate) struct FileDesiredStateProvider {
    path: PathBuf,
}

impl FileDesiredStateProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn is_yaml(&self) -> bool {
        matches!(
            self.path.extension().and_then(|v| v.to_str()),
            Some("yaml") | Some("yml")
        )
    }
}

impl DesiredStateProvider for FileDesiredStateProvider {
    async fn fetch(&self, _cluster: &ClusterIdentity) -> Result<Vec<ResourcePatch>, ControllerError> {
        let content = tokio::fs::read(&self.path).await?;
        let response: GetResourcePatchesResponse = if self.is_yaml() {
            serde_yaml::from_slice(&content)?
        } else {
            serde_json::from_slice(&content)?
        };
        Ok(response.resource_patches)
    }
}

/// The [`DesiredStateProvider`] selected at startup.
pub(crate) enum DesiredStateSource {
    Http(HttpDesiredStateProvider),
    File(FileDesiredStateProvider),
}

impl DesiredStateProvider for DesiredStateSource {
    async fn fetch(&self, cluster: &ClusterIdentity) -> Result<Vec<ResourcePatch>, ControllerError> {
        match self {
            DesiredStateSource::Http(p) => p.fetch(cluster).await,
            DesiredStateSource::File(p) => p.fetch(cluster).await,
        }
    }
}

impl std::fmt::Display for DesiredStateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredStateSource::Http(p) => write!(f, "{}", p.endpoint),
            DesiredStateSource::File(p) => write!(f, "{}", p.path.display()),
        }
    }
}
