use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::controller::{Action, Controller},
    runtime::events::{Event, EventType},
    runtime::finalizer::{finalizer, Event as Finalizer},
    runtime::watcher::Config,
    Resource,
};
use serde_json::json;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::api::kops_cluster::{KopsCluster, KopsCondition};
use crate::backend::cli::{CliClientset, CliCloudProvider, CliConnector};
use crate::backend::health::KubeHealthProbe;
use crate::backend::Connector;
use crate::metrics::Diagnostics;
use crate::reconcile::connection::IssuerConfig;
use crate::reconcile::engine::{decide, ConnectionDetails, Engine, NextAction, KUBECONFIG_KEY};
use crate::reconcile::DeleteError;
use crate::{telemetry, Error, Metrics, Result};

pub static KOPS_FINALIZER: &str = "kopsclusters.kops.cluster.x-k8s.io";

/// Field manager for server-side applied objects.
const FIELD_MANAGER: &str = "kops-operator";

// Context for the reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prom metrics
    pub metrics: Metrics,
    /// Factory for per-cluster state store clients
    pub connector: CliConnector,
    /// Provisioning backend
    pub provider: CliCloudProvider,
    /// Live health probe
    pub probe: KubeHealthProbe,
    /// Admin cert issuance settings
    pub issuer: IssuerConfig,
    /// Namespace kubeconfig secrets are written to
    pub secret_namespace: String,
}

impl Context {
    fn engine(
        &self,
        cluster: &KopsCluster,
    ) -> Result<Engine<CliClientset, CliCloudProvider, KubeHealthProbe>> {
        let clientset = self
            .connector
            .connect(&cluster.spec.state_store, &cluster.cluster_name())
            .map_err(Error::Connect)?;
        Ok(Engine::new(
            clientset,
            self.provider.clone(),
            self.probe.clone(),
            self.issuer.clone(),
        ))
    }
}

#[instrument(skip(ctx, cluster), fields(trace_id, name = %cluster.name_any()), err)]
async fn reconcile(cluster: Arc<KopsCluster>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    ctx.diagnostics.write().await.last_event = Utc::now();
    let _timer = ctx.metrics.count_and_measure();
    let api: Api<KopsCluster> = Api::all(ctx.client.clone());

    finalizer(&api, KOPS_FINALIZER, cluster, |event| async {
        match event {
            Finalizer::Apply(c) => apply(c, ctx.clone()).await,
            Finalizer::Cleanup(c) => cleanup(c, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

async fn apply(cluster: Arc<KopsCluster>, ctx: Arc<Context>) -> Result<Action> {
    let engine = ctx.engine(&cluster)?;
    let observation = engine.observe(&cluster).await?;

    // Connection details exist only after a validated observe; publication
    // happens on every such observe, drifted or not, never only on NoOp.
    if let Some(details) = &observation.connection_details {
        publish_connection(&ctx, &cluster, details).await?;
    }

    match decide(false, &observation) {
        NextAction::NeedsCreate => {
            info!("cluster is absent, creating");
            engine.create(&cluster).await?;
            publish_status(&ctx, &cluster, "Creating").await?;
            record(
                &ctx,
                &cluster,
                "Creating",
                format!("Creating cluster `{}`", cluster.cluster_name()),
            )
            .await?;
            Ok(Action::requeue(Duration::from_secs(2 * 60)))
        }
        NextAction::NeedsUpdate => {
            info!("cluster has drifted from spec, updating");
            engine.update(&cluster).await?;
            publish_status(&ctx, &cluster, "Updating").await?;
            record(
                &ctx,
                &cluster,
                "Updating",
                format!("Updating cluster `{}`", cluster.cluster_name()),
            )
            .await?;
            Ok(Action::requeue(Duration::from_secs(2 * 60)))
        }
        NextAction::NoOp | NextAction::NeedsDelete => {
            debug!("cluster matches spec");
            publish_status(&ctx, &cluster, "Available").await?;
            Ok(Action::requeue(Duration::from_secs(60 * 60)))
        }
    }
}

async fn cleanup(cluster: Arc<KopsCluster>, ctx: Arc<Context>) -> Result<Action> {
    publish_status(&ctx, &cluster, "Deleting").await?;
    record(
        &ctx,
        &cluster,
        "Deleting",
        format!("Deleting cluster `{}`", cluster.cluster_name()),
    )
    .await?;

    let engine = ctx.engine(&cluster)?;
    match engine.delete(&cluster).await {
        Ok(()) => Ok(Action::await_change()),
        Err(DeleteError::GetCluster(err)) if err.is_not_found() => {
            debug!("cluster already absent");
            Ok(Action::await_change())
        }
        Err(err) => Err(err.into()),
    }
}

/// Merge-patches the status subresource with the current lifecycle state.
async fn publish_status(ctx: &Context, cluster: &KopsCluster, state: &str) -> Result<()> {
    let ready = if state == "Available" { "True" } else { "False" };
    let status = json!({
        "status": {
            "conditions": [KopsCondition::ready(ready, state)],
            "provisioningState": state,
            "clusterName": cluster.cluster_name(),
        }
    });
    let api: Api<KopsCluster> = Api::all(ctx.client.clone());
    api.patch_status(
        &cluster.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&status),
    )
    .await
    .map_err(Error::StatusPatch)?;
    Ok(())
}

/// Writes the admin kubeconfig into a `<name>-kubeconfig` secret via
/// server-side apply, so repeated publication converges without conflicts.
async fn publish_connection(
    ctx: &Context,
    cluster: &KopsCluster,
    details: &ConnectionDetails,
) -> Result<()> {
    let name = format!("{}-kubeconfig", cluster.name_any());
    let secret = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": name,
            "namespace": ctx.secret_namespace,
        },
        "type": "Opaque",
        "stringData": {
            KUBECONFIG_KEY: String::from_utf8_lossy(&details.kubeconfig),
        },
    });
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &ctx.secret_namespace);
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&secret),
    )
    .await?;
    Ok(())
}

async fn record(ctx: &Context, cluster: &KopsCluster, reason: &str, note: String) -> Result<()> {
    ctx.diagnostics
        .read()
        .await
        .recorder(ctx.client.clone())
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: reason.into(),
                note: Some(note),
                action: reason.into(),
                secondary: None,
            },
            &cluster.object_ref(&()),
        )
        .await?;
    Ok(())
}

fn error_policy(cluster: Arc<KopsCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&cluster, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Runtime settings taken from the environment.
#[derive(Clone)]
pub struct OperatorConfig {
    /// Path to the kops binary
    pub kops_bin: String,
    /// Namespace kubeconfig secrets are written to
    pub secret_namespace: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            kops_bin: std::env::var("KOPS_BIN").unwrap_or_else(|_| "kops".into()),
            secret_namespace: std::env::var("OPERATOR_NAMESPACE")
                .unwrap_or_else(|_| "default".into()),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Runtime settings
    config: OperatorConfig,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: Metrics::default().register(&self.registry).unwrap(),
            diagnostics: self.diagnostics.clone(),
            connector: CliConnector {
                kops_bin: self.config.kops_bin.clone(),
            },
            provider: CliCloudProvider {
                kops_bin: self.config.kops_bin.clone(),
            },
            probe: KubeHealthProbe,
            issuer: IssuerConfig::default(),
            secret_namespace: self.config.secret_namespace.clone(),
        })
    }
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");
    let clusters = Api::<KopsCluster>::all(client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("KopsClusters are not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
    Controller::new(clusters, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
