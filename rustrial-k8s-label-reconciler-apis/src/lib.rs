use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kubernetes API resource type descriptor, identifying the REST endpoint of a
/// resource by its plural name rather than its Kind.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
pub struct GroupVersionResource {
    /// The Kubernetes API Group name (without the version part), empty for the core API group.
    #[serde(default)]
    pub group: String,
    /// The Kubernetes API version.
    pub version: String,
    /// The plural resource name (e.g. `nodes`).
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    /// The `apiVersion` string as used in Kubernetes manifests.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.resource)
    }
}

/// Desired label state for a single Kubernetes object.
///
/// The `ownedLabelsRegex` patterns declare which label keys this patch may add,
/// change or remove. Labels not matched by any of these patterns are never
/// touched, regardless of the content of `labels`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct ResourcePatch {
    /// The type of the target object.
    pub gvr: GroupVersionResource,
    /// The target object's name (`metadata.name`).
    #[serde(alias = "nodeName")]
    pub name: String,
    /// The target object's namespace (`metadata.namespace`), absent or empty for
    /// cluster scoped objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// The desired owned labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Regular expressions matching the label keys owned by this patch.
    #[serde(default, rename = "ownedLabelsRegex")]
    pub owned_labels_regex: Vec<String>,
}

impl ResourcePatch {
    /// The namespace of the target object, `None` for cluster scoped objects.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    pub fn id(&self) -> String {
        format!(
            "{}:{}/{}",
            self.gvr,
            self.namespace().unwrap_or(""),
            self.name
        )
    }
}

/// Identity of the cluster whose desired label state is requested.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
pub struct ClusterIdentity {
    #[serde(rename = "clusterId")]
    pub cluster_id: String,
    pub region: String,
    #[serde(rename = "availabilityZone")]
    pub availability_zone: String,
}

impl std::fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}/{}",
            self.cluster_id, self.region, self.availability_zone
        )
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct GetResourcePatchesRequest {
    #[serde(flatten)]
    pub cluster: ClusterIdentity,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
pub struct GetResourcePatchesResponse {
    #[serde(default, rename = "resourcePatches")]
    pub resource_patches: Vec<ResourcePatch>,
}
