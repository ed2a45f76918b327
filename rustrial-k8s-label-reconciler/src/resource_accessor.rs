use crate::{MANAGER, errors::ControllerError, label_diff::Labels};
use kube::{
    Api, Client, ResourceExt,
    api::{ApiResource, DynamicObject, PostParams, TypeMeta},
    config::{KubeConfigOptions, Kubeconfig},
    core::GroupVersion,
    discovery::{self, ApiCapabilities, Scope},
};
use rustrial_k8s_label_reconciler_apis::GroupVersionResource;
use std::{collections::HashMap, future::Future, path::PathBuf};
use tokio::sync::RwLock;

/// The cluster the resource patches are applied to. Chosen once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TargetCluster {
    /// The cluster the controller is running in (or the default kubeconfig context).
    Local,
    /// A remote cluster reached with the credentials of a kubeconfig file.
    Remote { kubeconfig: PathBuf },
}

impl TargetCluster {
    pub async fn client(&self) -> Result<Client, ControllerError> {
        match self {
            TargetCluster::Local => Ok(Client::try_default().await?),
            TargetCluster::Remote { kubeconfig } => {
                let kc = Kubeconfig::read_from(kubeconfig).map_err(|e| {
                    anyhow::anyhow!("failed to read kubeconfig {}: {}", kubeconfig.display(), e)
                })?;
                let config = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!(
                            "invalid kubeconfig {}: {}",
                            kubeconfig.display(),
                            e
                        )
                    })?;
                Ok(Client::try_from(config)?)
            }
        }
    }
}

impl std::fmt::Display for TargetCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetCluster::Local => write!(f, "local"),
            TargetCluster::Remote { kubeconfig } => write!(f, "remote ({})", kubeconfig.display()),
        }
    }
}

/// A live object fetched from the target cluster.
///
/// The object's `metadata.resourceVersion` is the concurrency token, which is
/// sent back with [`ResourceAccessor::update`] so that stale writes are rejected.
#[derive(Clone, Debug)]
pub(crate) struct TargetObject {
    pub gvr: GroupVersionResource,
    pub object: DynamicObject,
}

impl TargetObject {
    pub fn labels(&self) -> &Labels {
        self.object.labels()
    }

    pub fn set_labels(&mut self, labels: Labels) {
        self.object.metadata.labels = Some(labels);
    }

    pub fn resource_version(&self) -> Option<String> {
        self.object.resource_version()
    }
}

impl std::fmt::Display for TargetObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}/{}@{}",
            self.gvr,
            self.object.namespace().as_deref().unwrap_or(""),
            self.object.name_any(),
            self.resource_version().as_deref().unwrap_or("")
        )
    }
}

/// Typed-object access to the target cluster.
///
/// `get` must report a missing object as a not-found error (see
/// [`crate::errors::ExtKubeApiError::is_not_found`]) and `update` must report a
/// stale concurrency token as a conflict.
pub(crate) trait ResourceAccessor: Send + Sync {
    fn get(
        &self,
        gvr: &GroupVersionResource,
        name: &str,
        namespace: Option<&str>,
    ) -> impl Future<Output = Result<TargetObject, ControllerError>> + Send;

    fn update(
        &self,
        object: TargetObject,
    ) -> impl Future<Output = Result<TargetObject, ControllerError>> + Send;
}

/// [`ResourceAccessor`] backed by the Kubernetes API server.
pub(crate) struct KubeResourceAccessor {
    client: Client,
    /// Discovered API resources, resolved once per GroupVersionResource.
    resources: RwLock<HashMap<GroupVersionResource, (ApiResource, ApiCapabilities)>>,
}

impl KubeResourceAccessor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: Default::default(),
        }
    }

    async fn api_resource(
        &self,
        gvr: &GroupVersionResource,
    ) -> Result<(ApiResource, ApiCapabilities), ControllerError> {
        if let Some(resource) = self.resources.read().await.get(gvr) {
            return Ok(resource.clone());
        }
        let gv = GroupVersion::gv(gvr.group.as_str(), gvr.version.as_str());
        let apigroup = discovery::pinned_group(&self.client, &gv)
            .await
            .map_err(|e| {
                ControllerError::ApiDiscoveryError(format!(
                    "failed to discover API Group {}: {}",
                    gvr.api_version(),
                    e
                ))
            })?;
        let resource = apigroup
            .versioned_resources(gvr.version.as_str())
            .into_iter()
            .find(|(ar, _)| ar.plural == gvr.resource)
            .ok_or_else(|| {
                ControllerError::ApiDiscoveryError(format!(
                    "API Group {} does not serve resource {}",
                    gvr.api_version(),
                    gvr.resource
                ))
            })?;
        debug!(
            "discovered {} as kind {} ({:?})",
            gvr, resource.0.kind, resource.1.scope
        );
        self.resources
            .write()
            .await
            .insert(gvr.clone(), resource.clone());
        Ok(resource)
    }

    async fn api(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
    ) -> Result<(Api<DynamicObject>, ApiResource), ControllerError> {
        let (ar, caps) = self.api_resource(gvr).await?;
        let api = match (&caps.scope, namespace) {
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &ar),
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (Scope::Namespaced, None) => Err(ControllerError::MissingNamespace(format!(
                "{} is namespaced, but no namespace was provided",
                gvr
            )))?,
        };
        Ok((api, ar))
    }
}

impl ResourceAccessor for KubeResourceAccessor {
    async fn get(
        &self,
        gvr: &GroupVersionResource,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<TargetObject, ControllerError> {
        let (api, ar) = self.api(gvr, namespace).await?;
        let mut object = api.get(name).await?;
        // Make sure the object carries type information, as required by replace.
        object.types = object.types.or(Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        }));
        Ok(TargetObject {
            gvr: gvr.clone(),
            object,
        })
    }

    async fn update(&self, object: TargetObject) -> Result<TargetObject, ControllerError> {
        let namespace = object.object.namespace();
        let (api, _) = self.api(&object.gvr, namespace.as_deref()).await?;
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        let updated = api
            .replace(object.object.name_any().as_str(), &pp, &object.object)
            .await?;
        Ok(TargetObject {
            gvr: object.gvr,
            object: updated,
        })
    }
}
