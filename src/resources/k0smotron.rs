use crate::{Error, PodRef, Result};
use async_trait::async_trait;
use cluster::{Cluster, statefulset_name};
use join_token_request::{JoinTokenRequest, JoinTokenRequestStatus};
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{Pod, Secret},
};
use kube::{
    Resource,
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client as KubeClient,
    runtime::events::{Event, Recorder},
};
#[cfg(test)]
use mockall::automock;
use serde_json::json;

pub mod cluster;
pub mod join_token_request;

/// Object store operations the join token controller depends on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>>;

    /// A running member pod of the cluster's StatefulSet.
    async fn find_member_pod(&self, namespace: &str, cluster_name: &str) -> Result<PodRef>;

    /// Server-side apply, so repeated writes converge.
    async fn apply_secret(&self, secret: &Secret) -> Result<()>;

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn patch_status(
        &self,
        request: &JoinTokenRequest,
        status: &JoinTokenRequestStatus,
    ) -> Result<()>;

    async fn publish_event(&self, request: &JoinTokenRequest, event: Event) -> Result<()>;
}

pub struct KubeTokenStore {
    kube_client: KubeClient,
    recorder: Recorder,
    field_manager: String,
}

impl KubeTokenStore {
    pub fn new(kube_client: KubeClient, recorder: Recorder, field_manager: String) -> Self {
        Self {
            kube_client,
            recorder,
            field_manager,
        }
    }

    fn requests(&self, request: &JoinTokenRequest) -> Api<JoinTokenRequest> {
        Api::namespaced(
            self.kube_client.clone(),
            &request.namespace().unwrap_or_default(),
        )
    }
}

#[async_trait]
impl TokenStore for KubeTokenStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        let clusters: Api<Cluster> = Api::namespaced(self.kube_client.clone(), namespace);
        clusters.get_opt(name).await.map_err(Error::KubeError)
    }

    async fn find_member_pod(&self, namespace: &str, cluster_name: &str) -> Result<PodRef> {
        let name = statefulset_name(cluster_name);
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.kube_client.clone(), namespace);
        let statefulset = statefulsets
            .get_opt(&name)
            .await
            .map_err(Error::KubeError)?
            .ok_or_else(|| Error::MissingDependency(format!("statefulset {namespace}/{name}")))?;

        let selector = statefulset
            .spec
            .and_then(|spec| spec.selector.match_labels)
            .unwrap_or_default()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        if selector.is_empty() {
            return Err(Error::MissingDependency(format!(
                "statefulset {namespace}/{name} has no selector"
            )));
        }

        let pods: Api<Pod> = Api::namespaced(self.kube_client.clone(), namespace);
        let pods = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(Error::KubeError)?;

        pods.items
            .into_iter()
            .find(|pod| {
                pod.metadata.deletion_timestamp.is_none()
                    && pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
            })
            .map(|pod| PodRef {
                name: pod.name_any(),
                namespace: namespace.to_string(),
            })
            .ok_or_else(|| Error::NoRunningPod(format!("{namespace}/{name}")))
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(
            self.kube_client.clone(),
            &secret.namespace().unwrap_or_default(),
        );
        let ps = PatchParams::apply(&self.field_manager).force();
        secrets
            .patch(&secret.name_any(), &ps, &Patch::Apply(secret))
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let secrets: Api<Secret> = Api::namespaced(self.kube_client.clone(), namespace);
        Ok(secrets
            .get_metadata_opt(name)
            .await
            .map_err(Error::KubeError)?
            .is_some())
    }

    async fn patch_status(
        &self,
        request: &JoinTokenRequest,
        status: &JoinTokenRequestStatus,
    ) -> Result<()> {
        let new_status = Patch::Apply(json!({
            "apiVersion": JoinTokenRequest::api_version(&()),
            "kind": JoinTokenRequest::kind(&()),
            "status": status,
        }));
        let ps = PatchParams::apply(&self.field_manager).force();
        self.requests(request)
            .patch_status(&request.name_any(), &ps, &new_status)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn publish_event(&self, request: &JoinTokenRequest, event: Event) -> Result<()> {
        self.recorder
            .publish(&event, &request.object_ref(&()))
            .await
            .map_err(Error::KubeError)
    }
}
