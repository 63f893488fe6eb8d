use crate::{Context, Error, Result, telemetry, token};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::{ByteString, api::core::v1::Secret};
use kube::{
    CustomResource, Resource,
    api::{Api, ListParams, ObjectMeta, ResourceExt},
    client::Client as KubeClient,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType},
        finalizer::{Event as Finalizer, finalizer},
        watcher::Config,
    },
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::*;

pub use crate::token::Role;

pub static JOIN_TOKEN_FINALIZER: &str = "jointokenrequests.k0smotron.io/finalizer";

pub static CLUSTER_LABEL: &str = "k0smotron.io/cluster";
pub static CLUSTER_UID_LABEL: &str = "k0smotron.io/cluster-uid";
pub static ROLE_LABEL: &str = "k0smotron.io/role";
pub static TOKEN_REQUEST_LABEL: &str = "k0smotron.io/token-request";

static RECONCILED: &str = "Reconciliation successful";
static SECRET_MISSING: &str = "Token secret missing";

/// Request for a join token of a k0smotron cluster.
///
/// The token ends up in a Secret of the same name. Deleting the request
/// invalidates the token in the cluster before the object goes away.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "JoinTokenRequest",
    group = "k0smotron.io",
    version = "v1beta1",
    namespaced,
    shortname = "jtr",
    status = "JoinTokenRequestStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterRef.name"}"#,
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.role"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.reconciliationStatus"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct JoinTokenRequestSpec {
    /// `controller` or `worker`
    #[schemars(with = "String")]
    pub role: Role,
    /// Token lifetime, `0s` never expires
    #[serde(default = "default_expiry")]
    pub expiry: String,
    pub cluster_ref: ClusterRef,
}

fn default_expiry() -> String {
    "0s".into()
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ClusterRef {
    pub name: String,
    /// Defaults to the namespace of the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
pub struct JoinTokenRequestStatus {
    #[serde(rename = "tokenID", default)]
    pub token_id: String,
    #[serde(rename = "clusterUID", default)]
    pub cluster_uid: String,
    #[serde(rename = "reconciliationStatus", default)]
    pub reconciliation_status: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinTokenPhase {
    /// No token issued yet
    Pending,
    /// Token issued, never rotated
    Issued,
    /// Deletion requested, token not invalidated yet
    Deleting,
    /// Deletion requested and cleanup done
    Gone,
}

impl JoinTokenRequest {
    pub fn phase(&self) -> JoinTokenPhase {
        if self.meta().deletion_timestamp.is_some() {
            if self.has_finalizer() {
                JoinTokenPhase::Deleting
            } else {
                JoinTokenPhase::Gone
            }
        } else if self.token_id().is_empty() {
            JoinTokenPhase::Pending
        } else {
            JoinTokenPhase::Issued
        }
    }

    fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == JOIN_TOKEN_FINALIZER)
    }

    fn token_id(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.token_id.as_str())
            .unwrap_or_default()
    }

    fn cluster_namespace(&self) -> String {
        self.spec
            .cluster_ref
            .namespace
            .clone()
            .or_else(|| self.namespace())
            .unwrap_or_default()
    }

    pub fn create_command(&self) -> String {
        format!(
            "k0s token create --role={} --expiry={}",
            self.spec.role, self.spec.expiry
        )
    }

    pub fn invalidate_command(&self) -> String {
        format!("k0s token invalidate {}", self.token_id())
    }

    /// Secret holding the issued token, owned by the request.
    ///
    /// User labels are copied first so they cannot override the fixed keys.
    pub fn token_secret(&self, token: &str, cluster_uid: &str) -> Secret {
        let mut labels = self.labels().clone();
        labels.insert(CLUSTER_LABEL.into(), self.spec.cluster_ref.name.clone());
        labels.insert(CLUSTER_UID_LABEL.into(), cluster_uid.into());
        labels.insert(ROLE_LABEL.into(), self.spec.role.to_string());
        labels.insert(TOKEN_REQUEST_LABEL.into(), self.name_any());

        let annotations = self.annotations();
        Secret {
            metadata: ObjectMeta {
                name: Some(self.name_any()),
                namespace: self.namespace(),
                labels: Some(labels),
                annotations: (!annotations.is_empty()).then(|| annotations.clone()),
                owner_references: self.controller_owner_ref(&()).map(|o| vec![o]),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "token".to_string(),
                ByteString(token.as_bytes().to_vec()),
            )])),
            type_: Some("Opaque".into()),
            ..Default::default()
        }
    }

    /// Issues the token once, afterwards only watches over its secret.
    pub async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        if self.token_id().is_empty() {
            self.issue(&ctx).await
        } else {
            self.verify_secret(&ctx).await
        }
    }

    async fn issue(&self, ctx: &Context) -> Result<Action> {
        let mut status = self.current_status();

        // Reject before touching the cluster, retrying cannot fix this.
        let role = self.spec.role.bootstrap_user().map_err(Error::from);
        self.or_report(ctx, status.clone(), "Unsupported role", role)
            .await?;

        let cluster_ns = self.cluster_namespace();
        let cluster_name = &self.spec.cluster_ref.name;
        let cluster = match ctx.tokens.get_cluster(&cluster_ns, cluster_name).await {
            Ok(Some(cluster)) => Ok(cluster),
            Ok(None) => Err(Error::MissingDependency(format!(
                "cluster {cluster_ns}/{cluster_name}"
            ))),
            Err(e) => Err(e),
        };
        let cluster = self
            .or_report(ctx, status.clone(), "Failed getting cluster", cluster)
            .await?;
        status.cluster_uid = cluster.uid().unwrap_or_default();

        let pod = ctx.tokens.find_member_pod(&cluster_ns, cluster_name).await;
        let pod = self
            .or_report(ctx, status.clone(), "Failed finding pods in statefulset", pod)
            .await?;

        info!("Issuing {} token in pod {}/{}", self.spec.role, pod.namespace, pod.name);
        let output = ctx.executor.exec(&pod, &self.create_command()).await;
        let output = self
            .or_report(ctx, status.clone(), "Failed getting token", output)
            .await?;

        let replaced = token::replace_token_port(output.trim(), cluster.spec.service.api_port)
            .map_err(Error::from);
        let (token, config) = self
            .or_report(ctx, status.clone(), "Failed update token URL", replaced)
            .await?;

        let secret = self.token_secret(&token, &status.cluster_uid);
        let applied = ctx.tokens.apply_secret(&secret).await;
        self.or_report(ctx, status.clone(), "Failed creating secret", applied)
            .await?;

        let token_id = token::extract_token_id(&config, &self.spec.role).map_err(Error::from);
        status.token_id = self
            .or_report(ctx, status.clone(), "Failed getting token id", token_id)
            .await?;

        status.reconciliation_status = RECONCILED.into();
        ctx.tokens.patch_status(self, &status).await?;
        ctx.metrics.tokens.issued(self.spec.role.to_string());
        self.publish(
            ctx,
            EventType::Normal,
            "TokenIssued",
            "Issuing",
            format!("Issued {} token {}", self.spec.role, status.token_id),
        )
        .await;

        Ok(Action::await_change())
    }

    /// Issued requests only check that the token secret is still around.
    /// A lost secret is reported, the token is never issued twice.
    async fn verify_secret(&self, ctx: &Context) -> Result<Action> {
        let status = self.current_status();
        let ns = self.namespace().unwrap_or_default();
        let exists = ctx.tokens.secret_exists(&ns, &self.name_any()).await;
        if self
            .or_report(ctx, status.clone(), "Failed checking secret", exists)
            .await?
        {
            debug!("Already reconciled");
            return Ok(Action::await_change());
        }

        if status.reconciliation_status != SECRET_MISSING {
            warn!("Secret of JoinTokenRequest {ns}/{} is missing", self.name_any());
            self.report(ctx, status, SECRET_MISSING).await;
            self.publish(
                ctx,
                EventType::Warning,
                "SecretMissing",
                "Verifying",
                "Token secret was deleted, recreate the request for a new token".into(),
            )
            .await;
        }
        Ok(Action::await_change())
    }

    /// Invalidates the issued token. An error keeps the finalizer in place.
    pub async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let ctx = ctx.as_ref();
        let status = self.current_status();

        if !status.token_id.is_empty() {
            let cluster_ns = self.cluster_namespace();
            let cluster_name = &self.spec.cluster_ref.name;
            let cluster = ctx.tokens.get_cluster(&cluster_ns, cluster_name).await;
            let cluster = self
                .or_report(ctx, status.clone(), "Failed getting cluster", cluster)
                .await?;

            if cluster.is_some() {
                let pod = ctx.tokens.find_member_pod(&cluster_ns, cluster_name).await;
                let pod = self
                    .or_report(ctx, status.clone(), "Failed finding pods in statefulset", pod)
                    .await?;

                info!("Invalidating token {} in pod {}/{}", status.token_id, pod.namespace, pod.name);
                let invalidated = ctx.executor.exec(&pod, &self.invalidate_command()).await;
                self.or_report(ctx, status.clone(), "Failed invalidating token", invalidated)
                    .await?;

                ctx.metrics.tokens.invalidated(self.spec.role.to_string());
                self.publish(
                    ctx,
                    EventType::Normal,
                    "TokenInvalidated",
                    "Deleting",
                    format!("Invalidated token {}", status.token_id),
                )
                .await;
            } else {
                info!("Cluster {cluster_ns}/{cluster_name} is gone, nothing to invalidate");
            }
        }
        Ok(Action::await_change())
    }

    fn current_status(&self) -> JoinTokenRequestStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Record `message` as the outcome when `result` is an error.
    async fn or_report<T>(
        &self,
        ctx: &Context,
        status: JoinTokenRequestStatus,
        message: &str,
        result: Result<T>,
    ) -> Result<T> {
        if let Err(e) = &result {
            error!("{message}: {e}");
            self.report(ctx, status, message).await;
            self.publish(
                ctx,
                EventType::Warning,
                "ReconcileFailed",
                "Reconciling",
                format!("{message}: {e}"),
            )
            .await;
        }
        result
    }

    async fn report(&self, ctx: &Context, mut status: JoinTokenRequestStatus, message: &str) {
        status.reconciliation_status = message.into();
        if let Err(e) = ctx.tokens.patch_status(self, &status).await {
            error!("Unable to update status to `{message}`: {e}");
        }
    }

    async fn publish(
        &self,
        ctx: &Context,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(note),
            action: action.into(),
            secondary: None,
        };
        if let Err(e) = ctx.tokens.publish_event(self, event).await {
            warn!("Unable to publish {reason} event: {e}");
        }
    }
}

#[instrument(skip(ctx, request), fields(trace_id))]
async fn reconcile(request: Arc<JoinTokenRequest>, ctx: Arc<Context>) -> Result<Action> {
    let oref = request.object_ref(&());

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
    let ns = request.namespace().unwrap_or_default();
    let name = request.name_any();
    let requests: Api<JoinTokenRequest> = Api::namespaced(ctx.kube_client.clone(), &ns);

    // Work on a fresh copy, the cached one may predate our last status write.
    let Some(request) = requests.get_opt(&name).await.map_err(Error::KubeError)? else {
        debug!("JoinTokenRequest {ns}/{name} is gone");
        return Ok(Action::await_change());
    };

    info!(
        "Reconciling JoinTokenRequest \"{}\" in {} ({:?})",
        name,
        ns,
        request.phase()
    );
    finalizer(&requests, JOIN_TOKEN_FINALIZER, Arc::new(request), |event| async {
        match event {
            Finalizer::Apply(request) => request.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(request) => request.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

fn error_policy(request: Arc<JoinTokenRequest>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    let oref = request.object_ref(&());

    ctx.metrics.reconcile.set_failure(
        oref.api_version.unwrap_or_default(),
        oref.kind.unwrap_or_default(),
        request.name_any(),
        error,
    );
    if error.is_permanent() {
        Action::await_change()
    } else {
        Action::requeue(ctx.settings.retry_interval())
    }
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(context: Arc<Context>, kube_client: KubeClient) -> Result<(), Error> {
    let requests = Api::<JoinTokenRequest>::all(kube_client.clone());
    if requests
        .list(&ListParams::default().limit(1))
        .await
        .is_err()
    {
        return Err(Error::MissingCrds);
    }

    info!("Starting JoinTokenRequest controller");

    // Deleting a token secret triggers a check of its request.
    let secrets = Api::<Secret>::all(kube_client);
    Controller::new(requests, Config::default().any_semantic())
        .owns(secrets, Config::default().labels(TOKEN_REQUEST_LABEL))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        MockPodExecutor, PodRef,
        resources::k0smotron::{
            MockTokenStore,
            cluster::{Cluster, ClusterSpec, ServiceSpec},
        },
        token::tests::JOIN_KUBECONFIG,
    };
    use assert_json_diff::assert_json_include;
    use http::{Method, Request, Response, StatusCode};
    use kube::client::Body;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    static REQUEST_PATH: &str = "/apis/k0smotron.io/v1beta1/namespaces/default/jointokenrequests/join";

    fn request(role: &str) -> JoinTokenRequest {
        let mut request = JoinTokenRequest::new(
            "join",
            JoinTokenRequestSpec {
                role: Role::from(role.to_string()),
                expiry: "1h".into(),
                cluster_ref: ClusterRef {
                    name: "kmc".into(),
                    namespace: None,
                },
            },
        );
        request.metadata.namespace = Some("default".into());
        request.metadata.uid = Some("jtr-uid".into());
        request.metadata.resource_version = Some("1".into());
        request
    }

    fn with_finalizer(mut request: JoinTokenRequest) -> JoinTokenRequest {
        request.metadata.finalizers = Some(vec![JOIN_TOKEN_FINALIZER.to_string()]);
        request
    }

    fn issued(mut request: JoinTokenRequest) -> JoinTokenRequest {
        request.status = Some(JoinTokenRequestStatus {
            token_id: "abcdef".into(),
            cluster_uid: "cluster-uid".into(),
            reconciliation_status: RECONCILED.into(),
        });
        request
    }

    fn deleting(mut request: JoinTokenRequest) -> JoinTokenRequest {
        request.metadata.deletion_timestamp =
            Some(serde_json::from_value(json!("2024-05-01T10:00:00Z")).unwrap());
        request
    }

    fn cluster(api_port: u16) -> Cluster {
        let mut cluster = Cluster::new(
            "kmc",
            ClusterSpec {
                service: ServiceSpec {
                    api_port,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("default".into());
        cluster.metadata.uid = Some("cluster-uid".into());
        cluster
    }

    fn member_pod() -> PodRef {
        PodRef {
            name: "kmc-kmc-0".into(),
            namespace: "default".into(),
        }
    }

    /// Store recording every status written.
    fn recording_store(statuses: Arc<Mutex<Vec<JoinTokenRequestStatus>>>) -> MockTokenStore {
        let mut store = MockTokenStore::new();
        store.expect_patch_status().returning(move |_, status| {
            statuses.lock().unwrap().push(status.clone());
            Ok(())
        });
        store.expect_publish_event().returning(|_, _| Ok(()));
        store
    }

    fn context(store: MockTokenStore, executor: MockPodExecutor) -> Arc<Context> {
        Arc::new(Context {
            tokens: Arc::new(store),
            executor: Arc::new(executor),
            ..Context::mocked()
        })
    }

    /// Context whose kube client is served by the returned handle.
    fn api_context(
        store: MockTokenStore,
        executor: MockPodExecutor,
    ) -> (Arc<Context>, ApiServerHandle) {
        let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let ctx = Arc::new(Context {
            kube_client: KubeClient::new(service, "default"),
            tokens: Arc::new(store),
            executor: Arc::new(executor),
            ..Context::mocked()
        });
        (ctx, handle)
    }

    /// Answers the next API call with `object` and returns method, path and body of the call.
    async fn answer(handle: &mut ApiServerHandle, object: &JoinTokenRequest) -> (Method, String, String) {
        let (call, send) = handle.next_request().await.expect("api server not called");
        let method = call.method().clone();
        let path = call.uri().path().to_string();
        let body = call.into_body().collect_bytes().await.unwrap();
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(object).unwrap()))
                .unwrap(),
        );
        (method, path, String::from_utf8(body.to_vec()).unwrap())
    }

    fn last_message(statuses: &Arc<Mutex<Vec<JoinTokenRequestStatus>>>) -> String {
        statuses
            .lock()
            .unwrap()
            .last()
            .map(|s| s.reconciliation_status.clone())
            .unwrap_or_default()
    }

    fn cluster_store(statuses: Arc<Mutex<Vec<JoinTokenRequestStatus>>>) -> MockTokenStore {
        let mut store = recording_store(statuses);
        store
            .expect_get_cluster()
            .withf(|ns, name| ns == "default" && name == "kmc")
            .returning(|_, _| Ok(Some(cluster(6443))));
        store
            .expect_find_member_pod()
            .returning(|_, _| Ok(member_pod()));
        store
    }

    #[test]
    fn phases_follow_token_and_deletion_state() {
        assert_eq!(request("worker").phase(), JoinTokenPhase::Pending);
        assert_eq!(issued(request("worker")).phase(), JoinTokenPhase::Issued);
        assert_eq!(
            deleting(with_finalizer(issued(request("worker")))).phase(),
            JoinTokenPhase::Deleting
        );
        assert_eq!(deleting(issued(request("worker"))).phase(), JoinTokenPhase::Gone);
    }

    #[test]
    fn commands_carry_role_expiry_and_token_id() {
        assert_eq!(
            request("controller").create_command(),
            "k0s token create --role=controller --expiry=1h"
        );
        assert_eq!(
            issued(request("worker")).invalidate_command(),
            "k0s token invalidate abcdef"
        );
    }

    #[test]
    fn token_secret_keeps_fixed_labels_over_user_labels() {
        let mut request = request("worker");
        request.metadata.labels = Some(BTreeMap::from([
            ("team".to_string(), "infra".to_string()),
            (ROLE_LABEL.to_string(), "controller".to_string()),
        ]));
        request.metadata.annotations =
            Some(BTreeMap::from([("note".to_string(), "hello".to_string())]));

        let secret = request.token_secret("dG9rZW4=", "cluster-uid");
        assert_json_include!(
            actual: serde_json::to_value(&secret).unwrap(),
            expected: json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {
                    "name": "join",
                    "namespace": "default",
                    "labels": {
                        "team": "infra",
                        "k0smotron.io/cluster": "kmc",
                        "k0smotron.io/cluster-uid": "cluster-uid",
                        "k0smotron.io/role": "worker",
                        "k0smotron.io/token-request": "join",
                    },
                    "annotations": { "note": "hello" },
                    "ownerReferences": [{
                        "apiVersion": "k0smotron.io/v1beta1",
                        "kind": "JoinTokenRequest",
                        "name": "join",
                        "uid": "jtr-uid",
                        "controller": true,
                    }],
                },
                "type": "Opaque",
            })
        );
    }


    #[tokio::test]
    async fn fresh_request_issues_a_token_with_the_cluster_port() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut store = cluster_store(statuses.clone());
        let secrets = Arc::new(Mutex::new(Vec::new()));
        let applied = secrets.clone();
        store.expect_apply_secret().times(1).returning(move |secret| {
            applied.lock().unwrap().push(secret.clone());
            Ok(())
        });

        let mut executor = MockPodExecutor::new();
        let issued_token = token::encode(JOIN_KUBECONFIG.as_bytes()).unwrap();
        executor
            .expect_exec()
            .withf(|pod, command| {
                *pod == member_pod() && command == "k0s token create --role=worker --expiry=1h"
            })
            .times(1)
            .returning(move |_, _| Ok(format!("{issued_token}\n")));

        let ctx = context(store, executor);
        let action = with_finalizer(request("worker"))
            .reconcile(ctx.clone())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());

        let secret = secrets.lock().unwrap().pop().unwrap();
        let encoded = &secret.data.as_ref().unwrap()["token"];
        let document = token::decode(std::str::from_utf8(&encoded.0).unwrap()).unwrap();
        let config: token::ClientConfig = serde_yaml::from_slice(&document).unwrap();
        let server = &config.clusters.iter().find(|c| c.name == "k0s").unwrap().cluster.server;
        assert!(server.ends_with(":6443"), "{server}");
        assert_eq!(
            secret.labels().get(CLUSTER_UID_LABEL).map(String::as_str),
            Some("cluster-uid")
        );

        let status = statuses.lock().unwrap().last().cloned().unwrap();
        assert_eq!(
            status,
            JoinTokenRequestStatus {
                token_id: "abcdef".into(),
                cluster_uid: "cluster-uid".into(),
                reconciliation_status: RECONCILED.into(),
            }
        );
    }

    #[tokio::test]
    async fn token_without_id_is_never_marked_issued() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut store = cluster_store(statuses.clone());
        store.expect_apply_secret().returning(|_| Ok(()));
        let mut executor = MockPodExecutor::new();
        let idless = JOIN_KUBECONFIG.replace("abcdef.0123456789abcdef", "\"\"");
        let idless_token = token::encode(idless.as_bytes()).unwrap();
        executor
            .expect_exec()
            .times(1)
            .returning(move |_, _| Ok(idless_token.clone()));

        let ctx = context(store, executor);
        let err = with_finalizer(request("worker"))
            .reconcile(ctx.clone())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TokenError(token::Error::EmptyTokenId(_))
        ));
        assert_eq!(last_message(&statuses), "Failed getting token id");
        assert!(
            statuses
                .lock()
                .unwrap()
                .iter()
                .all(|s| s.token_id.is_empty() && s.reconciliation_status != RECONCILED)
        );
        // Another attempt would only mint another unusable token.
        assert_eq!(
            error_policy(Arc::new(request("worker")), &err, ctx),
            Action::await_change()
        );
    }

    #[tokio::test]
    async fn issued_request_with_its_secret_is_left_alone() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut store = recording_store(statuses.clone());
        store
            .expect_secret_exists()
            .withf(|ns, name| ns == "default" && name == "join")
            .returning(|_, _| Ok(true));
        let mut executor = MockPodExecutor::new();
        executor.expect_exec().never();

        let action = with_finalizer(issued(request("worker")))
            .reconcile(context(store, executor))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert!(statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_secret_is_reported_without_reissuing() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut store = recording_store(statuses.clone());
        store.expect_secret_exists().returning(|_, _| Ok(false));
        store.expect_apply_secret().never();
        let mut executor = MockPodExecutor::new();
        executor.expect_exec().never();

        with_finalizer(issued(request("worker")))
            .reconcile(context(store, executor))
            .await
            .unwrap();

        let status = statuses.lock().unwrap().last().cloned().unwrap();
        assert_eq!(status.reconciliation_status, SECRET_MISSING);
        assert_eq!(status.token_id, "abcdef");
    }

    #[tokio::test]
    async fn missing_cluster_is_a_soft_failure() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut store = recording_store(statuses.clone());
        store.expect_get_cluster().returning(|_, _| Ok(None));
        store.expect_find_member_pod().never();

        let ctx = context(store, MockPodExecutor::new());
        let err = with_finalizer(request("worker"))
            .reconcile(ctx.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingDependency(_)));
        assert_eq!(last_message(&statuses), "Failed getting cluster");
        assert_eq!(
            error_policy(Arc::new(request("worker")), &err, ctx),
            Action::requeue(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn failed_issuance_is_reported() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut store = cluster_store(statuses.clone());
        store.expect_apply_secret().never();
        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .returning(|_, _| Err(Error::ExecFailed("k0s not found".into())));

        let err = with_finalizer(request("controller"))
            .reconcile(context(store, executor))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExecFailed(_)));
        assert_eq!(last_message(&statuses), "Failed getting token");
    }

    #[tokio::test]
    async fn garbage_token_output_is_reported() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut store = cluster_store(statuses.clone());
        store.expect_apply_secret().never();
        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .returning(|_, _| Ok("Error: unknown flag".into()));

        let err = with_finalizer(request("worker"))
            .reconcile(context(store, executor))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenError(_)));
        assert!(!err.is_permanent());
        assert_eq!(last_message(&statuses), "Failed update token URL");
    }

    #[tokio::test]
    async fn unsupported_role_fails_permanently_before_any_side_effect() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut store = recording_store(statuses.clone());
        store.expect_get_cluster().never();
        let mut executor = MockPodExecutor::new();
        executor.expect_exec().never();

        let ctx = context(store, executor);
        let err = with_finalizer(request("etcd"))
            .reconcile(ctx.clone())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(last_message(&statuses), "Unsupported role");

        // The controller sees it wrapped by the finalizer helper.
        let err = Error::FinalizerError(Box::new(kube::runtime::finalizer::Error::ApplyFailed(err)));
        assert_eq!(
            error_policy(Arc::new(request("etcd")), &err, ctx),
            Action::await_change()
        );
    }

    #[tokio::test]
    async fn cleanup_of_an_unissued_request_skips_invalidation() {
        let mut store = MockTokenStore::new();
        store.expect_get_cluster().never();
        let mut executor = MockPodExecutor::new();
        executor.expect_exec().never();

        let action = deleting(with_finalizer(request("worker")))
            .cleanup(context(store, executor))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn cleanup_without_cluster_skips_invalidation() {
        let mut store = recording_store(Arc::new(Mutex::new(Vec::new())));
        store.expect_get_cluster().returning(|_, _| Ok(None));
        store.expect_find_member_pod().never();
        let mut executor = MockPodExecutor::new();
        executor.expect_exec().never();

        deleting(with_finalizer(issued(request("worker"))))
            .cleanup(context(store, executor))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_request_gets_the_finalizer_before_any_token() {
        let mut executor = MockPodExecutor::new();
        executor.expect_exec().never();
        let (ctx, mut handle) = api_context(MockTokenStore::new(), executor);

        let fresh = request("worker");
        let server = tokio::spawn(async move {
            let (method, path, _) = answer(&mut handle, &fresh).await;
            assert_eq!(method, Method::GET);
            assert_eq!(path, REQUEST_PATH);

            let (method, path, body) = answer(&mut handle, &with_finalizer(fresh.clone())).await;
            assert_eq!(method, Method::PATCH);
            assert_eq!(path, REQUEST_PATH);
            assert!(body.contains(JOIN_TOKEN_FINALIZER), "{body}");
        });

        let action = reconcile(Arc::new(request("worker")), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn successful_invalidation_releases_the_finalizer() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let store = cluster_store(statuses.clone());
        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .withf(|pod, command| *pod == member_pod() && command == "k0s token invalidate abcdef")
            .times(1)
            .returning(|_, _| Ok(String::new()));
        let (ctx, mut handle) = api_context(store, executor);

        let doomed = deleting(with_finalizer(issued(request("worker"))));
        let server = tokio::spawn(async move {
            let (method, _, _) = answer(&mut handle, &doomed).await;
            assert_eq!(method, Method::GET);

            let released = deleting(issued(request("worker")));
            let (method, path, body) = answer(&mut handle, &released).await;
            assert_eq!(method, Method::PATCH);
            assert_eq!(path, REQUEST_PATH);
            assert!(body.contains("remove"), "{body}");
        });

        let action = reconcile(Arc::new(request("worker")), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        server.await.unwrap();
        assert!(statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_invalidation_keeps_the_finalizer() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let store = cluster_store(statuses.clone());
        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .withf(|_, command| command == "k0s token invalidate abcdef")
            .returning(|_, _| Err(Error::ExecFailed("connection refused".into())));
        let (ctx, mut handle) = api_context(store, executor);

        let doomed = deleting(with_finalizer(issued(request("worker"))));
        // Only the read is answered, a finalizer patch would fail the reconcile.
        let server = tokio::spawn(async move {
            let (method, _, _) = answer(&mut handle, &doomed).await;
            assert_eq!(method, Method::GET);
        });

        let err = reconcile(Arc::new(request("worker")), ctx.clone())
            .await
            .unwrap_err();
        server.await.unwrap();
        match &err {
            Error::FinalizerError(e) => assert!(matches!(
                e.as_ref(),
                kube::runtime::finalizer::Error::CleanupFailed(Error::ExecFailed(_))
            )),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(last_message(&statuses), "Failed invalidating token");
        assert_eq!(
            error_policy(Arc::new(request("worker")), &err, ctx),
            Action::requeue(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn finished_deletion_is_a_no_op() {
        let mut executor = MockPodExecutor::new();
        executor.expect_exec().never();
        let (ctx, mut handle) = api_context(MockTokenStore::new(), executor);

        let released = deleting(issued(request("worker")));
        let server = tokio::spawn(async move {
            let (method, _, _) = answer(&mut handle, &released).await;
            assert_eq!(method, Method::GET);
        });

        let action = reconcile(Arc::new(request("worker")), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn vanished_request_is_ignored() {
        let (ctx, mut handle) = api_context(MockTokenStore::new(), MockPodExecutor::new());
        let server = tokio::spawn(async move {
            let (call, send) = handle.next_request().await.expect("api server not called");
            assert_eq!(call.uri().path(), REQUEST_PATH);
            let status = json!({
                "apiVersion": "v1",
                "kind": "Status",
                "status": "Failure",
                "message": "jointokenrequests.k0smotron.io \"join\" not found",
                "reason": "NotFound",
                "code": 404
            });
            send.send_response(
                Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from(serde_json::to_vec(&status).unwrap()))
                    .unwrap(),
            );
        });

        let action = reconcile(Arc::new(request("worker")), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        server.await.unwrap();
    }
}
