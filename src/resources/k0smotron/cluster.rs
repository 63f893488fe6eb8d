use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Hosted k0s control plane. Only read by the join token controller.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "Cluster",
    group = "k0smotron.io",
    version = "v1beta1",
    namespaced,
    shortname = "kmc"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub service: ServiceSpec,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(rename = "type", default = "default_service_type")]
    pub type_: String,
    /// Externally reachable port of the control plane API
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_konnectivity_port")]
    pub konnectivity_port: u16,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            type_: default_service_type(),
            api_port: default_api_port(),
            konnectivity_port: default_konnectivity_port(),
        }
    }
}

fn default_service_type() -> String {
    "NodePort".into()
}

fn default_api_port() -> u16 {
    30443
}

fn default_konnectivity_port() -> u16 {
    30132
}

/// StatefulSet running the control plane members of a cluster.
pub fn statefulset_name(cluster_name: &str) -> String {
    format!("kmc-{cluster_name}")
}
