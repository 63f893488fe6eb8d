use crate::{Error, Result, resources::capi::{Machine, control_plane_selector}};
use async_trait::async_trait;
use k0s_control_plane::{K0sControlPlane, K0sControlPlaneStatus};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Resource,
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client as KubeClient,
    config::{Config, KubeConfigOptions, Kubeconfig},
};
#[cfg(test)]
use mockall::automock;
use serde_json::json;

pub mod k0s_control_plane;
pub mod status;

/// Object store operations the control plane status update depends on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlaneStore: Send + Sync {
    /// Control plane machines of a Cluster API cluster.
    async fn list_machines(&self, namespace: &str, cluster_name: &str) -> Result<Vec<Machine>>;

    async fn patch_status(
        &self,
        control_plane: &K0sControlPlane,
        status: &K0sControlPlaneStatus,
    ) -> Result<()>;
}

/// Access to the API servers of workload clusters.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClusters: Send + Sync {
    async fn connect(&self, namespace: &str, cluster_name: &str) -> Result<KubeClient>;
}

pub struct KubeControlPlaneStore {
    kube_client: KubeClient,
    field_manager: String,
}

impl KubeControlPlaneStore {
    pub fn new(kube_client: KubeClient, field_manager: String) -> Self {
        Self {
            kube_client,
            field_manager,
        }
    }
}

#[async_trait]
impl ControlPlaneStore for KubeControlPlaneStore {
    async fn list_machines(&self, namespace: &str, cluster_name: &str) -> Result<Vec<Machine>> {
        let machines: Api<Machine> = Api::namespaced(self.kube_client.clone(), namespace);
        let machines = machines
            .list(&ListParams::default().labels(&control_plane_selector(cluster_name)))
            .await
            .map_err(Error::KubeError)?;
        Ok(machines.items)
    }

    async fn patch_status(
        &self,
        control_plane: &K0sControlPlane,
        status: &K0sControlPlaneStatus,
    ) -> Result<()> {
        let control_planes: Api<K0sControlPlane> = Api::namespaced(
            self.kube_client.clone(),
            &control_plane.namespace().unwrap_or_default(),
        );
        let new_status = Patch::Apply(json!({
            "apiVersion": K0sControlPlane::api_version(&()),
            "kind": K0sControlPlane::kind(&()),
            "status": status,
        }));
        let ps = PatchParams::apply(&self.field_manager).force();
        control_planes
            .patch_status(&control_plane.name_any(), &ps, &new_status)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}

/// Connects through the `<cluster>-kubeconfig` secret Cluster API maintains.
pub struct KubeconfigSecretClusters {
    kube_client: KubeClient,
}

impl KubeconfigSecretClusters {
    pub fn new(kube_client: KubeClient) -> Self {
        Self { kube_client }
    }
}

#[async_trait]
impl WorkloadClusters for KubeconfigSecretClusters {
    async fn connect(&self, namespace: &str, cluster_name: &str) -> Result<KubeClient> {
        let secrets: Api<Secret> = Api::namespaced(self.kube_client.clone(), namespace);
        let name = format!("{cluster_name}-kubeconfig");
        let secret = secrets.get(&name).await.map_err(Error::KubeError)?;

        let value = secret
            .data
            .as_ref()
            .and_then(|data| data.get("value"))
            .ok_or_else(|| Error::WorkloadClusterError(format!("secret {name} has no kubeconfig")))?;
        let kubeconfig = std::str::from_utf8(&value.0)
            .map_err(|e| Error::WorkloadClusterError(format!("invalid kubeconfig UTF-8: {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
            .map_err(|e| Error::WorkloadClusterError(format!("invalid kubeconfig: {e}")))?;

        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::WorkloadClusterError(format!("failed to build config: {e}")))?;
        KubeClient::try_from(config)
            .map_err(|e| Error::WorkloadClusterError(format!("failed to create client: {e}")))
    }
}
