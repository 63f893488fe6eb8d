use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
pub static CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Cluster API Machine, only the fields the status aggregation reads.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "Machine",
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    namespaced,
    status = "MachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    pub cluster_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MachinePhase {
    Pending,
    Provisioning,
    Provisioned,
    Running,
    Deleting,
    Deleted,
    Failed,
    Unknown,
    Other(String),
}

impl From<&str> for MachinePhase {
    fn from(phase: &str) -> Self {
        match phase {
            "Pending" => MachinePhase::Pending,
            "Provisioning" => MachinePhase::Provisioning,
            "Provisioned" => MachinePhase::Provisioned,
            "Running" => MachinePhase::Running,
            "Deleting" => MachinePhase::Deleting,
            "Deleted" => MachinePhase::Deleted,
            "Failed" => MachinePhase::Failed,
            "Unknown" | "" => MachinePhase::Unknown,
            other => MachinePhase::Other(other.to_string()),
        }
    }
}

impl Machine {
    pub fn phase(&self) -> MachinePhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(MachinePhase::from)
            .unwrap_or(MachinePhase::Unknown)
    }

    pub fn version(&self) -> &str {
        self.spec.version.as_deref().unwrap_or_default()
    }
}

/// Label selector matching the control plane machines of a cluster.
pub fn control_plane_selector(cluster_name: &str) -> String {
    format!("{CLUSTER_NAME_LABEL}={cluster_name},{CONTROL_PLANE_LABEL}")
}
