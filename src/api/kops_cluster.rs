use std::time::Duration;

use chrono::Utc;
use kube::api::ObjectMeta;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cluster::{Cluster, InstanceGroup, InstanceGroupSpec, KOPS_API_VERSION};
use super::cluster::ClusterSpec;
use kube::api::TypeMeta;

pub static READY_CONDITION: &str = "Ready";

/// Desired state of a kOps cluster and its instance groups.
///
/// The external identity of the cluster is `<name>.<domain>`; mutating either
/// part addresses a different external resource.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "KopsCluster",
    group = "kops.cluster.x-k8s.io",
    version = "v1alpha1",
    shortname = "kc",
    status = "KopsClusterStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.provisioningState"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KopsClusterSpec {
    /// Declarative cluster topology and configuration.
    pub cluster: ClusterSpec,
    /// Instance groups, matched to observed groups by the instancegroup label.
    #[serde(default)]
    pub instance_groups: Vec<InstanceGroupSpec>,
    /// DNS domain forming the cluster identity together with the object name.
    pub domain: String,
    /// Location of the kOps state registry, e.g. `file:///var/lib/kops` or
    /// `s3://bucket`.
    pub state_store: String,
    /// Cloud region the provisioned resources are scoped to.
    pub region: String,
    /// Validity of issued administrative client certificates, in hours.
    /// Zero means the 18 hour default.
    #[serde(default)]
    pub api_cert_ttl_hours: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KopsClusterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<KopsCondition>,
    /// Last lifecycle phase entered by the reconciler. Set optimistically
    /// when an operation is invoked; a consumer must re-observe to learn the
    /// true outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,
    /// External name of the managed cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KopsCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl KopsCondition {
    pub fn ready(status: &str, reason: &str) -> Self {
        Self {
            kind: READY_CONDITION.into(),
            status: status.into(),
            reason: reason.into(),
            message: None,
            last_transition_time: Some(Utc::now().to_rfc3339()),
        }
    }
}

impl KopsCluster {
    /// Deterministic external name: `<name>.<domain>`.
    pub fn cluster_name(&self) -> String {
        format!("{}.{}", self.name_any(), self.spec.domain)
    }

    /// State registry location derived for this cluster.
    pub fn config_base(&self) -> String {
        format!("{}/{}", self.spec.state_store, self.cluster_name())
    }

    pub fn cert_ttl(&self) -> Duration {
        Duration::from_secs(self.spec.api_cert_ttl_hours.saturating_mul(3600))
    }

    /// One full conversion of the desired spec into the target cluster
    /// object. Always recomputed from the source of truth, never from a
    /// previously observed object.
    pub fn build_cluster(&self) -> Cluster {
        let mut spec = self.spec.cluster.clone();
        spec.config_base = Some(self.config_base());
        Cluster::new(&self.cluster_name(), spec)
    }
}

/// Builds the target instance group object for a desired group spec. The
/// object is named after the instancegroup label value.
pub fn build_instance_group(spec: &InstanceGroupSpec) -> InstanceGroup {
    InstanceGroup {
        types: Some(TypeMeta {
            api_version: KOPS_API_VERSION.into(),
            kind: "InstanceGroup".into(),
        }),
        metadata: ObjectMeta {
            name: Some(spec.group_name().unwrap_or_default().to_string()),
            ..Default::default()
        },
        spec: spec.clone(),
    }
}
