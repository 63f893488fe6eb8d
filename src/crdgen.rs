use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let documents = vec![
        k0smotron::resources::k0smotron::join_token_request::JoinTokenRequest::crd(),
        k0smotron::resources::k0smotron::cluster::Cluster::crd(),
        k0smotron::resources::controlplane::k0s_control_plane::K0sControlPlane::crd(),
    ];

    for document in documents {
        print!("---\n");
        print!("{}", serde_yaml::to_string(&document)?);
    }
    Ok(())
}
