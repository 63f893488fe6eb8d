//! Status of a control plane, derived from its Machines and a live API probe.
use super::{
    WorkloadClusters,
    k0s_control_plane::{
        CONTROL_PLANE_READY, K0sControlPlane, K0sControlPlaneSpec, K0sControlPlaneStatus, Severity,
    },
};
use crate::{
    Context, Result,
    resources::capi::{Machine, MachinePhase, control_plane_selector},
};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ResourceExt};
use semver::Version;
use std::time::Duration;
use tracing::*;

/// Build metadata k0s appends to plain Kubernetes versions.
pub static DEFAULT_VERSION_SUFFIX: &str = "+k0s.0";

pub static UNABLE_TO_CONNECT: &str = "Unable to connect to the workload cluster API";

/// Phase and version of a single control plane member.
#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    pub phase: MachinePhase,
    pub version: String,
}

impl From<&Machine> for Member {
    fn from(machine: &Machine) -> Self {
        Self {
            phase: machine.phase(),
            version: machine.version().to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComputedStatus {
    pub replicas: i32,
    pub ready_replicas: i32,
    pub updated_replicas: i32,
    pub unavailable_replicas: i32,
    /// Lowest member version as the member spells it
    pub version: Option<String>,
    pub external_managed_control_plane: bool,
}

impl ComputedStatus {
    pub fn apply_to(self, status: &mut K0sControlPlaneStatus) {
        status.replicas = self.replicas;
        status.ready_replicas = self.ready_replicas;
        status.updated_replicas = self.updated_replicas;
        status.unavailable_replicas = self.unavailable_replicas;
        if let Some(version) = self.version {
            status.version = version;
        }
        status.external_managed_control_plane = self.external_managed_control_plane;
    }
}

fn parse_version(version: &str) -> std::result::Result<Version, semver::Error> {
    Version::parse(version.strip_prefix('v').unwrap_or(version))
}

fn with_default_suffix(version: &str) -> String {
    if version.contains('+') {
        version.to_string()
    } else {
        format!("{version}{DEFAULT_VERSION_SUFFIX}")
    }
}

/// Whether a member runs the desired version, tolerating a missing `+k0s.N`.
pub fn version_matches(member: &str, desired: &str) -> bool {
    if member.is_empty() {
        return false;
    }
    if member == desired {
        return true;
    }
    match (
        parse_version(&with_default_suffix(member)),
        parse_version(&with_default_suffix(desired)),
    ) {
        (Ok(member), Ok(desired)) => member == desired,
        _ => false,
    }
}

fn lowest_version(members: &[Member]) -> Option<String> {
    members
        .iter()
        .filter(|m| !m.version.is_empty())
        .filter_map(|m| match parse_version(&m.version) {
            Ok(parsed) => Some((parsed, &m.version)),
            Err(e) => {
                warn!("Skipping unparsable member version {:?}: {}", m.version, e);
                None
            }
        })
        .min_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, raw)| raw.clone())
}

fn count(members: &[Member], predicate: impl Fn(&Member) -> bool) -> i32 {
    members.iter().filter(|&m| predicate(m)).count() as i32
}

pub fn compute_status(members: &[Member], spec: &K0sControlPlaneSpec) -> ComputedStatus {
    ComputedStatus {
        replicas: members.len() as i32,
        ready_replicas: count(members, |m| m.phase == MachinePhase::Running),
        updated_replicas: count(members, |m| version_matches(&m.version, &spec.version)),
        unavailable_replicas: count(members, |m| {
            !matches!(
                m.phase,
                MachinePhase::Running | MachinePhase::Deleting | MachinePhase::Deleted
            )
        }),
        version: lowest_version(members),
        external_managed_control_plane: spec.externally_managed(),
    }
}

/// Checks that the workload cluster API answers within `timeout`.
///
/// Failures only show up in the `ControlPlaneReady` condition.
pub async fn probe_readiness(
    clusters: &dyn WorkloadClusters,
    namespace: &str,
    cluster_name: &str,
    timeout: Duration,
    status: &mut K0sControlPlaneStatus,
) {
    info!("Pinging the workload cluster API");
    let client = match clusters.connect(namespace, cluster_name).await {
        Ok(client) => client,
        Err(e) => {
            info!("Failed to create workload cluster client: {}", e);
            status.mark_false(
                CONTROL_PLANE_READY,
                UNABLE_TO_CONNECT,
                Severity::Warning,
                format!("Failed to create workload cluster client: {e}"),
            );
            return;
        }
    };

    let namespaces: Api<Namespace> = Api::all(client);
    let message = match tokio::time::timeout(timeout, namespaces.get("kube-system")).await {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(format!("Failed to get namespace kube-system: {e}")),
        Err(_) => Some(format!(
            "Timed out after {}s getting namespace kube-system",
            timeout.as_secs()
        )),
    };
    if let Some(message) = message {
        info!("{}", message);
        status.mark_false(CONTROL_PLANE_READY, UNABLE_TO_CONNECT, Severity::Warning, message);
        return;
    }

    status.mark_true(CONTROL_PLANE_READY);
    status.ready = true;
    status.control_plane_ready = true;
    status.initialized = true;
}

/// Refreshes `status` from the Machines of `cluster_name` and the live API.
pub async fn update_status(
    ctx: &Context,
    control_plane: &K0sControlPlane,
    cluster_name: &str,
    status: &mut K0sControlPlaneStatus,
) -> Result<()> {
    let namespace = control_plane.namespace().unwrap_or_default();
    status.selector = control_plane_selector(cluster_name);

    let machines = ctx
        .control_planes
        .list_machines(&namespace, cluster_name)
        .await?;
    let members: Vec<Member> = machines.iter().map(Member::from).collect();
    let computed = compute_status(&members, &control_plane.spec);
    debug!("Computed status {:?}", computed);
    computed.apply_to(status);

    status.ready = false;
    probe_readiness(
        ctx.workload_clusters.as_ref(),
        &namespace,
        cluster_name,
        ctx.settings.probe_timeout(),
        status,
    )
    .await;
    Ok(())
}
