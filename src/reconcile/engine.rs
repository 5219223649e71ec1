//! The level-triggered reconciliation engine.
//!
//! Every invocation recomputes the full desired action from live queries;
//! nothing is persisted between cycles. The engine never retries internally:
//! retry and backoff belong to the invoking controller.

use tracing::{debug, instrument};

use super::compare;
use super::connection::{self, ConnectionDescriptor, IssuerConfig};
use super::validation;
use super::{CreateError, DeleteError, ObserveError, UpdateError};
use crate::api::kops_cluster::{build_instance_group, KopsCluster};
use crate::backend::{ApplyTarget, Clientset, Cloud, CloudProvider, HealthProbe};

/// Well-known connection-details key the kubeconfig artifact is published
/// under.
pub static KUBECONFIG_KEY: &str = "kubeconfig";

/// Result of one observe pass. Ephemeral; reconstructed every cycle.
#[derive(Clone, Debug, Default)]
pub struct Observation {
    pub exists: bool,
    pub up_to_date: bool,
    pub connection_details: Option<ConnectionDetails>,
}

impl Observation {
    fn absent() -> Self {
        Self::default()
    }
}

/// Connection details published back to the caller after a validated
/// observe.
#[derive(Clone, Debug)]
pub struct ConnectionDetails {
    pub kubeconfig: Vec<u8>,
}

/// The action a reconciliation cycle must take, derived from the observed
/// state alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextAction {
    NoOp,
    NeedsCreate,
    NeedsUpdate,
    NeedsDelete,
}

/// Stateless decision function, separated from the side-effecting execution
/// so it is independently testable.
pub fn decide(deleting: bool, observation: &Observation) -> NextAction {
    match (deleting, observation.exists, observation.up_to_date) {
        (true, true, _) => NextAction::NeedsDelete,
        (true, false, _) => NextAction::NoOp,
        (false, false, _) => NextAction::NeedsCreate,
        (false, true, false) => NextAction::NeedsUpdate,
        (false, true, true) => NextAction::NoOp,
    }
}

/// Orchestrates the four-phase lifecycle against one cluster's collaborators.
///
/// A single pass is strictly sequential. The engine is safe to run
/// concurrently for different cluster identities; serialization per identity
/// is the invoking controller's guarantee.
pub struct Engine<CS, P, H> {
    clientset: CS,
    provider: P,
    probe: H,
    issuer: IssuerConfig,
    target: ApplyTarget,
}

impl<CS, P, H> Engine<CS, P, H>
where
    CS: Clientset,
    P: CloudProvider,
    H: HealthProbe<P::Cloud>,
{
    pub fn new(clientset: CS, provider: P, probe: H, issuer: IssuerConfig) -> Self {
        Self {
            clientset,
            provider,
            probe,
            issuer,
            target: ApplyTarget::Direct,
        }
    }

    pub fn with_target(mut self, target: ApplyTarget) -> Self {
        self.target = target;
        self
    }

    /// Fetches observed state and decides whether it matches the desired
    /// spec.
    ///
    /// A missing cluster is not an error; that is the trigger for create. A
    /// cluster that exists but fails validation is surfaced as an error, not
    /// folded into the up-to-date decision.
    #[instrument(skip_all, fields(cluster = %desired.cluster_name()))]
    pub async fn observe(&self, desired: &KopsCluster) -> Result<Observation, ObserveError> {
        let name = desired.cluster_name();

        let cluster = match self.clientset.get_cluster(&name).await {
            Ok(cluster) => cluster,
            Err(err) if err.is_not_found() => {
                debug!("cluster does not exist");
                return Ok(Observation::absent());
            }
            Err(err) => return Err(ObserveError::GetCluster(err)),
        };

        let groups = self
            .clientset
            .list_instance_groups(&cluster)
            .await
            .map_err(ObserveError::InstanceGroups)?;

        let conn = connection::build_connection(
            &self.clientset,
            &cluster,
            desired.cert_ttl(),
            &self.issuer,
        )
        .await?;

        let result =
            validation::validate(&self.probe, &self.provider, &conn, &cluster, &groups).await?;
        if !result.ok {
            return Err(ObserveError::ClusterState(result.messages.join(", ")));
        }

        let kubeconfig = conn.kubeconfig().map_err(ObserveError::Kubeconfig)?;

        let up_to_date = compare::cluster_up_to_date(&desired.spec.cluster, &cluster.spec)
            && compare::instance_group_changes(&desired.spec.instance_groups, &groups).is_empty();

        Ok(Observation {
            exists: true,
            up_to_date,
            connection_details: Some(ConnectionDetails { kubeconfig }),
        })
    }

    /// Creates the cluster object, then every instance group in desired list
    /// order, then provisions infrastructure. The first group failure aborts
    /// the whole create; already created state is left for the next cycle to
    /// reconcile.
    #[instrument(skip_all, fields(cluster = %desired.cluster_name()))]
    pub async fn create(&self, desired: &KopsCluster) -> Result<(), CreateError> {
        let cluster = desired.build_cluster();

        let mut created = self
            .clientset
            .create_cluster(&cluster)
            .await
            .map_err(CreateError::CreateCluster)?;

        for spec in &desired.spec.instance_groups {
            let group = build_instance_group(spec);
            self.clientset
                .create_instance_group(&created, &group)
                .await
                .map_err(|source| CreateError::CreateInstanceGroup {
                    name: group.name(),
                    source,
                })?;
        }

        let cloud = self
            .provider
            .build_cloud(&created)
            .map_err(CreateError::Cloud)?;
        self.provider
            .perform_assignments(&mut created, &cloud)
            .map_err(CreateError::CloudAssignment)?;

        self.provider
            .apply(&cloud, &created, self.target)
            .await
            .map_err(CreateError::Apply)
    }

    /// Rebuilds the cluster object from the desired spec, updates backend
    /// state and every instance group, then re-runs the provisioning engine.
    /// Steps are sequential and not transactional; each is safe to re-run
    /// against partially applied prior state.
    #[instrument(skip_all, fields(cluster = %desired.cluster_name()))]
    pub async fn update(&self, desired: &KopsCluster) -> Result<(), UpdateError> {
        let mut cluster = desired.build_cluster();

        let cloud = self
            .provider
            .build_cloud(&cluster)
            .map_err(UpdateError::Cloud)?;
        self.provider
            .perform_assignments(&mut cluster, &cloud)
            .map_err(UpdateError::CloudAssignment)?;

        let status = cloud
            .find_cluster_status(&cluster)
            .await
            .map_err(UpdateError::ClusterStatus)?;

        let updated = self
            .clientset
            .update_cluster(&cluster, &status)
            .await
            .map_err(UpdateError::UpdateCluster)?;

        for spec in &desired.spec.instance_groups {
            let group = build_instance_group(spec);
            self.clientset
                .update_instance_group(&updated, &group)
                .await
                .map_err(|source| UpdateError::UpdateInstanceGroup {
                    name: group.name(),
                    source,
                })?;
        }

        self.provider
            .apply(&cloud, &updated, self.target)
            .await
            .map_err(UpdateError::Apply)
    }

    /// Deletes provider-owned resources scoped to the cluster and region,
    /// then the cluster object itself. Unlike create, delete requires the
    /// cluster to exist.
    #[instrument(skip_all, fields(cluster = %desired.cluster_name()))]
    pub async fn delete(&self, desired: &KopsCluster) -> Result<(), DeleteError> {
        let cluster = self
            .clientset
            .get_cluster(&desired.cluster_name())
            .await
            .map_err(DeleteError::GetCluster)?;

        let cloud = self
            .provider
            .build_cloud(&cluster)
            .map_err(DeleteError::Cloud)?;

        let resources = cloud
            .list_resources(&cluster, &desired.spec.region)
            .await
            .map_err(DeleteError::ListResources)?;
        cloud
            .delete_resources(&resources)
            .await
            .map_err(DeleteError::DeleteResources)?;

        self.clientset
            .delete_cluster(&cluster)
            .await
            .map_err(DeleteError::DeleteCluster)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::api::cluster::{
        ClusterSpec, InstanceGroupRole, InstanceGroupSpec, INSTANCE_GROUP_LABEL,
    };
    use crate::api::kops_cluster::KopsClusterSpec;
    use crate::backend::fakes::{FakeClientset, FakeProbe, FakeProvider};
    use crate::backend::{ClusterHealth, HealthFailure};

    fn group_spec(name: &str, size: i32) -> InstanceGroupSpec {
        let mut node_labels = BTreeMap::new();
        node_labels.insert(INSTANCE_GROUP_LABEL.to_string(), name.to_string());
        InstanceGroupSpec {
            role: InstanceGroupRole::Node,
            machine_type: "m5.large".into(),
            min_size: size,
            max_size: size,
            node_labels,
            ..Default::default()
        }
    }

    fn desired(groups: Vec<InstanceGroupSpec>) -> KopsCluster {
        let mut kc = KopsCluster::new(
            "a",
            KopsClusterSpec {
                cluster: ClusterSpec {
                    kubernetes_version: "1.30.2".into(),
                    cloud_provider: "aws".into(),
                    ..Default::default()
                },
                instance_groups: groups,
                domain: "example.com".into(),
                state_store: "s3://kops-state".into(),
                region: "us-east-1".into(),
                api_cert_ttl_hours: 0,
            },
        );
        kc.metadata.name = Some("a".into());
        kc
    }

    fn engine(
        clientset: FakeClientset,
        provider: FakeProvider,
        probe: FakeProbe,
    ) -> Engine<FakeClientset, FakeProvider, FakeProbe> {
        Engine::new(clientset, provider, probe, IssuerConfig::default())
    }

    async fn seed(clientset: &FakeClientset, desired: &KopsCluster) {
        clientset
            .clusters
            .lock()
            .unwrap()
            .insert(desired.cluster_name(), desired.build_cluster());
    }

    #[tokio::test]
    async fn observe_missing_cluster_is_not_an_error() {
        let engine = engine(
            FakeClientset::with_keyset(),
            FakeProvider::default(),
            FakeProbe::default(),
        );
        let obs = engine.observe(&desired(vec![])).await.unwrap();
        assert!(!obs.exists);
        assert!(obs.connection_details.is_none());
    }

    #[tokio::test]
    async fn observe_propagates_broken_backend() {
        let mut clientset = FakeClientset::with_keyset();
        clientset.fail.insert("get_cluster");
        let engine = engine(clientset, FakeProvider::default(), FakeProbe::default());
        let err = engine.observe(&desired(vec![])).await.unwrap_err();
        assert!(matches!(err, ObserveError::GetCluster(_)));
    }

    #[tokio::test]
    async fn observe_surfaces_validation_failure_as_error() {
        let clientset = FakeClientset::with_keyset();
        let spec = desired(vec![]);
        seed(&clientset, &spec).await;
        let probe = FakeProbe {
            health: ClusterHealth {
                failures: vec![HealthFailure {
                    kind: "InstanceGroup".into(),
                    name: "nodes".into(),
                    message: "machine not yet joined".into(),
                }],
                nodes: vec![],
            },
        };
        let engine = engine(clientset, FakeProvider::default(), probe);
        let err = engine.observe(&spec).await.unwrap_err();
        match err {
            ObserveError::ClusterState(msg) => assert!(msg.contains("machine not yet joined")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn observe_in_sync_cluster_is_up_to_date_with_details() {
        let clientset = FakeClientset::with_keyset();
        let spec = desired(vec![]);
        seed(&clientset, &spec).await;
        let engine = engine(clientset, FakeProvider::default(), FakeProbe::default());
        let obs = engine.observe(&spec).await.unwrap();
        assert!(obs.exists);
        assert!(obs.up_to_date);
        let details = obs.connection_details.unwrap();
        let kubeconfig = String::from_utf8(details.kubeconfig).unwrap();
        assert!(kubeconfig.contains("a.example.com"));
    }

    #[tokio::test]
    async fn observe_detects_cluster_drift() {
        let clientset = FakeClientset::with_keyset();
        let spec = desired(vec![]);
        seed(&clientset, &spec).await;
        let mut drifted = spec.clone();
        drifted.spec.cluster.kubernetes_version = "1.29.0".into();
        let engine = engine(clientset, FakeProvider::default(), FakeProbe::default());
        let obs = engine.observe(&drifted).await.unwrap();
        assert!(obs.exists);
        assert!(!obs.up_to_date);
    }

    #[tokio::test]
    async fn observe_counts_missing_group_as_drift() {
        let clientset = FakeClientset::with_keyset();
        let without_groups = desired(vec![]);
        seed(&clientset, &without_groups).await;
        let with_group = desired(vec![group_spec("nodes", 1)]);
        let engine = engine(clientset, FakeProvider::default(), FakeProbe::default());
        let obs = engine.observe(&with_group).await.unwrap();
        assert!(!obs.up_to_date);
    }

    #[tokio::test]
    async fn create_makes_cluster_then_groups_in_list_order() {
        let clientset = FakeClientset::with_keyset();
        let log = clientset.log.clone();
        let spec = desired(vec![group_spec("masters", 1), group_spec("nodes", 3)]);
        let engine = engine(clientset, FakeProvider::default(), FakeProbe::default());
        engine.create(&spec).await.unwrap();
        assert_eq!(
            log.calls(),
            vec![
                "create_cluster",
                "create_instance_group masters",
                "create_instance_group nodes",
            ]
        );
    }

    #[tokio::test]
    async fn create_aborts_on_first_group_failure() {
        let mut clientset = FakeClientset::with_keyset();
        clientset.fail.insert("create_instance_group");
        let log = clientset.log.clone();
        let groups = clientset.groups.clone();
        let spec = desired(vec![group_spec("masters", 1), group_spec("nodes", 3)]);
        let engine = engine(clientset, FakeProvider::default(), FakeProbe::default());
        let err = engine.create(&spec).await.unwrap_err();
        assert!(matches!(
            err,
            CreateError::CreateInstanceGroup { ref name, .. } if name == "masters"
        ));
        // No rollback and no further group creation.
        assert_eq!(
            log.calls(),
            vec!["create_cluster", "create_instance_group masters"]
        );
        assert!(groups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_runs_provisioning_in_direct_mode() {
        let provider = FakeProvider::default();
        let plog = provider.log.clone();
        let engine = engine(
            FakeClientset::with_keyset(),
            provider,
            FakeProbe::default(),
        );
        engine.create(&desired(vec![])).await.unwrap();
        assert_eq!(
            plog.calls(),
            vec!["build_cloud", "perform_assignments", "apply direct"]
        );
    }

    #[tokio::test]
    async fn update_assignment_failure_skips_backend_update() {
        let clientset = FakeClientset::with_keyset();
        let clog = clientset.log.clone();
        let mut provider = FakeProvider::default();
        provider.fail.insert("perform_assignments");
        let engine = engine(clientset, provider, FakeProbe::default());
        let err = engine.update(&desired(vec![])).await.unwrap_err();
        assert!(matches!(err, UpdateError::CloudAssignment(_)));
        assert!(clog.calls().is_empty());
    }

    #[tokio::test]
    async fn update_touches_cluster_then_groups_then_applies() {
        let clientset = FakeClientset::with_keyset();
        let clog = clientset.log.clone();
        let provider = FakeProvider::default();
        let plog = provider.log.clone();
        let spec = desired(vec![group_spec("nodes", 3)]);
        let engine = engine(clientset, provider, FakeProbe::default());
        engine.update(&spec).await.unwrap();
        assert_eq!(
            clog.calls(),
            vec!["update_cluster", "update_instance_group nodes"]
        );
        assert_eq!(
            plog.calls(),
            vec![
                "build_cloud",
                "perform_assignments",
                "find_cluster_status",
                "apply direct"
            ]
        );
    }

    #[tokio::test]
    async fn delete_requires_prior_existence() {
        let engine = engine(
            FakeClientset::with_keyset(),
            FakeProvider::default(),
            FakeProbe::default(),
        );
        let err = engine.delete(&desired(vec![])).await.unwrap_err();
        match err {
            DeleteError::GetCluster(source) => assert!(source.is_not_found()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_removes_cloud_resources_before_state() {
        let clientset = FakeClientset::with_keyset();
        let spec = desired(vec![]);
        seed(&clientset, &spec).await;
        let clog = clientset.log.clone();
        let provider = FakeProvider::default();
        let plog = provider.log.clone();
        let engine = engine(clientset, provider, FakeProbe::default());
        engine.delete(&spec).await.unwrap();
        assert_eq!(clog.calls(), vec!["get_cluster", "delete_cluster"]);
        assert_eq!(
            plog.calls(),
            vec!["build_cloud", "list_resources us-east-1", "delete_resources 1"]
        );
    }

    #[test]
    fn decision_covers_the_lifecycle() {
        let absent = Observation::default();
        let drifted = Observation {
            exists: true,
            up_to_date: false,
            connection_details: None,
        };
        let settled = Observation {
            exists: true,
            up_to_date: true,
            connection_details: None,
        };
        assert_eq!(decide(false, &absent), NextAction::NeedsCreate);
        assert_eq!(decide(false, &drifted), NextAction::NeedsUpdate);
        assert_eq!(decide(false, &settled), NextAction::NoOp);
        assert_eq!(decide(true, &settled), NextAction::NeedsDelete);
        assert_eq!(decide(true, &absent), NextAction::NoOp);
    }
}
