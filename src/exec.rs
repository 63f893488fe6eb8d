use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, AttachParams},
    client::Client as KubeClient,
};
#[cfg(test)]
use mockall::automock;
use tokio::io::AsyncReadExt;
use tracing::*;

/// Pod a command is executed in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

/// Runs commands inside member pods and returns their standard output.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodExecutor: Send + Sync {
    async fn exec(&self, pod: &PodRef, command: &str) -> Result<String>;
}

pub struct KubePodExecutor {
    kube_client: KubeClient,
}

impl KubePodExecutor {
    pub fn new(kube_client: KubeClient) -> Self {
        Self { kube_client }
    }
}

#[async_trait]
impl PodExecutor for KubePodExecutor {
    async fn exec(&self, pod: &PodRef, command: &str) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.kube_client.clone(), &pod.namespace);
        debug!("Executing `{command}` in pod {}/{}", pod.namespace, pod.name);

        let params = AttachParams::default().stdin(false).stdout(true).stderr(false);
        let mut attached = pods
            .exec(&pod.name, command.split_whitespace(), &params)
            .await
            .map_err(Error::KubeError)?;

        let mut output = String::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout.read_to_string(&mut output).await?;
        }

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| Error::ExecFailed(e.to_string()))?;

        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                return Err(Error::ExecFailed(
                    status
                        .message
                        .unwrap_or_else(|| format!("`{command}` failed")),
                ));
            }
        }

        Ok(output)
    }
}
