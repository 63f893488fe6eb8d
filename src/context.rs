use crate::{
    Diagnostics, Metrics, PodExecutor, Settings,
    resources::{
        controlplane::{ControlPlaneStore, WorkloadClusters},
        k0smotron::TokenStore,
    },
};
use kube::Client as KubeClient;
use std::sync::Arc;
use tokio::sync::RwLock;

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub kube_client: KubeClient,
    /// Join token requests, clusters and their secrets
    pub tokens: Arc<dyn TokenStore>,
    /// Command execution in control plane pods
    pub executor: Arc<dyn PodExecutor>,
    /// Control planes and their machines
    pub control_planes: Arc<dyn ControlPlaneStore>,
    pub workload_clusters: Arc<dyn WorkloadClusters>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
    /// Settings
    pub settings: Arc<Settings>,
}

#[cfg(test)]
impl Context {
    /// Context whose collaborators fail the test when called.
    ///
    /// The client talks to an API server that is already gone, so this needs
    /// a tokio runtime.
    pub fn mocked() -> Self {
        use crate::{
            MockPodExecutor,
            resources::{
                controlplane::{MockControlPlaneStore, MockWorkloadClusters},
                k0smotron::MockTokenStore,
            },
        };

        let (service, _) = tower_test::mock::pair::<
            http::Request<kube::client::Body>,
            http::Response<kube::client::Body>,
        >();
        Self {
            kube_client: KubeClient::new(service, "default"),
            tokens: Arc::new(MockTokenStore::new()),
            executor: Arc::new(MockPodExecutor::new()),
            control_planes: Arc::new(MockControlPlaneStore::new()),
            workload_clusters: Arc::new(MockWorkloadClusters::new()),
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Arc::new(Metrics::default()),
            settings: Arc::new(Settings::default()),
        }
    }
}
