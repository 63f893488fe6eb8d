use crate::{Error, State, resources};
use kube::client::Client;
use tracing::*;

/// Initialize the controllers and shared state (given the crds are installed)
pub async fn run(state: State) -> Result<(), Error> {
    let kube_client = Client::try_default().await.map_err(Error::KubeError)?;
    let controllers = &state.settings().controllers;

    let join_token_requests = async {
        if !controllers.join_token_request {
            info!("JoinTokenRequest controller disabled");
            return Ok(());
        }
        resources::k0smotron::join_token_request::run(
            state.to_context(kube_client.clone()).await,
            kube_client.clone(),
        )
        .await
    };

    let control_planes = async {
        if !controllers.control_plane {
            info!("K0sControlPlane controller disabled");
            return Ok(());
        }
        resources::controlplane::k0s_control_plane::run(
            state.to_context(kube_client.clone()).await,
            kube_client.clone(),
        )
        .await
    };

    tokio::try_join!(join_token_requests, control_planes).map(|_| ())
}
