use std::collections::BTreeMap;

use kube::api::{ObjectMeta, TypeMeta};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group/version of the objects stored in the kOps state registry.
pub static KOPS_API_VERSION: &str = "kops.k8s.io/v1alpha2";

/// Node label carrying the instance group identity. Desired and observed
/// instance groups are matched on the value of this label, never on list
/// position.
pub static INSTANCE_GROUP_LABEL: &str = "kops.k8s.io/instancegroup";

/// Object label associating an instance group document with its cluster.
pub static CLUSTER_LABEL: &str = "kops.k8s.io/cluster";

/// A cluster object as stored in the kOps state registry.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Cluster {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    pub metadata: ObjectMeta,
    pub spec: ClusterSpec,
}

impl Cluster {
    pub fn new(name: &str, spec: ClusterSpec) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: KOPS_API_VERSION.into(),
                kind: "Cluster".into(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
        }
    }

    pub fn name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }
}

/// The declarative cluster configuration.
///
/// `config_base` and `master_public_name` are assigned by the backend and are
/// never part of desired intent; the state comparator normalizes them away
/// before diffing.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub kubernetes_version: String,
    pub cloud_provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_public_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<SubnetSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_clusters: Vec<EtcdClusterSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_access: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kubernetes_api_access: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    pub zone: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_members: Vec<EtcdMemberSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdMemberSpec {
    pub name: String,
    pub instance_group: String,
}

/// An instance group object as stored in the kOps state registry.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct InstanceGroup {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    pub metadata: ObjectMeta,
    pub spec: InstanceGroupSpec,
}

impl InstanceGroup {
    pub fn name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }
}

/// A named, homogeneously configured pool of cluster nodes.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupSpec {
    pub role: InstanceGroupRole,
    pub machine_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub min_size: i32,
    #[serde(default)]
    pub max_size: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels: BTreeMap<String, String>,
}

impl InstanceGroupSpec {
    /// Identity of the group, carried in the instancegroup node label.
    pub fn group_name(&self) -> Option<&str> {
        self.node_labels.get(INSTANCE_GROUP_LABEL).map(String::as_str)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum InstanceGroupRole {
    ControlPlane,
    #[default]
    Node,
    Bastion,
}

/// Provider-reported cluster status, passed back to the backend on update so
/// it can reject mutations of immutable fields.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_clusters: Vec<EtcdClusterStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

/// A provisioned cloud-level resource owned by a cluster (compute, network,
/// and the like), enumerated during deletion.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudResource {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
