use super::status::update_status;
use crate::{
    Context, Error, Result,
    resources::capi::{CLUSTER_NAME_LABEL, Machine},
    telemetry,
};
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use kube::{
    CustomResource, Resource,
    api::{Api, ListParams, ResourceExt},
    client::Client as KubeClient,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::*;

pub static CONTROL_PLANE_READY: &str = "ControlPlaneReady";

/// k0s control plane of a Cluster API cluster, made of Machines.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "K0sControlPlane",
    group = "controlplane.cluster.x-k8s.io",
    version = "v1beta1",
    namespaced,
    shortname = "kcp",
    status = "K0sControlPlaneStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct K0sControlPlaneSpec {
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    pub version: String,
    #[serde(default)]
    pub k0s_config_spec: K0sConfigSpec,
}

fn default_replicas() -> i32 {
    1
}

impl K0sControlPlaneSpec {
    /// Controllers without `--enable-worker` leave workloads to other nodes.
    pub fn externally_managed(&self) -> bool {
        !self
            .k0s_config_spec
            .args
            .iter()
            .any(|arg| arg == "--enable-worker")
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct K0sConfigSpec {
    /// Extra arguments of the k0s controller process
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct K0sControlPlaneStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub control_plane_ready: bool,
    /// Set while the controllers do not run workloads themselves
    #[serde(default)]
    pub external_managed_control_plane: bool,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
    #[serde(default)]
    pub unavailable_replicas: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Only set on conditions that are `False`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub enum Severity {
    Warning,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl K0sControlPlaneStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn mark_true(&mut self, type_: &str) {
        self.set_condition(Condition {
            type_: type_.to_string(),
            status: "True".into(),
            severity: None,
            reason: None,
            message: None,
            last_transition_time: None,
        });
    }

    pub fn mark_false(&mut self, type_: &str, reason: &str, severity: Severity, message: String) {
        self.set_condition(Condition {
            type_: type_.to_string(),
            status: "False".into(),
            severity: Some(severity),
            reason: Some(reason.to_string()),
            message: Some(message),
            last_transition_time: None,
        });
    }

    // lastTransitionTime only moves when the status flips
    fn set_condition(&mut self, mut condition: Condition) {
        let previous = self.conditions.iter().position(|c| c.type_ == condition.type_);
        condition.last_transition_time = match previous.map(|i| &self.conditions[i]) {
            Some(old) if old.status == condition.status => old.last_transition_time.clone(),
            _ => Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        };
        match previous {
            Some(i) => self.conditions[i] = condition,
            None => self.conditions.push(condition),
        }
    }
}

impl K0sControlPlane {
    /// Name of the owning Cluster API cluster.
    pub fn cluster_name(&self) -> Option<String> {
        self.owner_references()
            .iter()
            .find(|o| o.kind == "Cluster" && o.api_version.starts_with("cluster.x-k8s.io/"))
            .map(|o| o.name.clone())
            .or_else(|| self.labels().get(CLUSTER_NAME_LABEL).cloned())
    }

    pub async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        if self.meta().deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }
        let Some(cluster_name) = self.cluster_name() else {
            info!("Waiting for the owning Cluster to be set");
            return Ok(Action::await_change());
        };

        let mut status = self.status.clone().unwrap_or_default();
        update_status(&ctx, self, &cluster_name, &mut status).await?;
        ctx.control_planes.patch_status(self, &status).await?;

        // The API probe has to be repeated even without changes.
        Ok(Action::requeue(ctx.settings.status_resync()))
    }
}

#[instrument(skip(ctx, control_plane), fields(trace_id))]
async fn reconcile(control_plane: Arc<K0sControlPlane>, ctx: Arc<Context>) -> Result<Action> {
    let oref = control_plane.object_ref(&());

    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.reconcile.count_and_measure(
        oref.api_version.unwrap_or_default(),
        oref.kind.unwrap_or_default(),
        &trace_id,
    );
    ctx.diagnostics.write().await.last_event = Utc::now();

    info!(
        "Reconciling K0sControlPlane \"{}\" in {}",
        control_plane.name_any(),
        control_plane.namespace().unwrap_or_default()
    );
    control_plane.reconcile(ctx.clone()).await
}

fn error_policy(control_plane: Arc<K0sControlPlane>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    let oref = control_plane.object_ref(&());

    ctx.metrics.reconcile.set_failure(
        oref.api_version.unwrap_or_default(),
        oref.kind.unwrap_or_default(),
        control_plane.name_any(),
        error,
    );
    Action::requeue(ctx.settings.retry_interval())
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(context: Arc<Context>, kube_client: KubeClient) -> Result<(), Error> {
    let control_planes = Api::<K0sControlPlane>::all(kube_client.clone());
    if control_planes
        .list(&ListParams::default().limit(1))
        .await
        .is_err()
    {
        return Err(Error::MissingCrds);
    }

    info!("Starting K0sControlPlane controller");

    let machines = Api::<Machine>::all(kube_client);
    Controller::new(control_planes, Config::default().any_semantic())
        .owns(machines, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}
