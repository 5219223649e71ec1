//! Cluster health probe over a short-lived administrative API client.

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};

use super::{
    BackendError, ClusterHealth, HealthFailure, HealthProbe, NodeHealth, NodeReadiness,
};
use crate::api::cluster::{
    Cluster, InstanceGroup, InstanceGroupRole, INSTANCE_GROUP_LABEL,
};
use crate::reconcile::connection::ConnectionDescriptor;

#[derive(Clone, Debug, Default)]
pub struct KubeHealthProbe;

impl<C> HealthProbe<C> for KubeHealthProbe {
    async fn check(
        &self,
        conn: &ConnectionDescriptor,
        _cluster: &Cluster,
        _cloud: &C,
        groups: &[InstanceGroup],
        api_url: &str,
    ) -> Result<ClusterHealth, BackendError> {
        let kubeconfig = conn
            .kubeconfig()
            .map_err(|err| BackendError::Api(err.to_string()))?;
        let parsed = Kubeconfig::from_yaml(&String::from_utf8_lossy(&kubeconfig))?;
        let mut config = Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
            .await?;
        config.cluster_url = api_url
            .parse::<http::Uri>()
            .map_err(|err| BackendError::Api(format!("invalid api url {api_url:?}: {err}")))?;
        let client = Client::try_from(config)?;

        let nodes: Api<Node> = Api::all(client);
        let list = nodes.list(&ListParams::default()).await?;

        Ok(reduce_health(&list.items, groups))
    }
}

fn reduce_health(nodes: &[Node], groups: &[InstanceGroup]) -> ClusterHealth {
    let mut health = ClusterHealth::default();

    for group in groups {
        if group.spec.role == InstanceGroupRole::Bastion {
            continue;
        }
        let name = group.name();
        let joined = nodes
            .iter()
            .filter(|node| {
                node.labels().get(INSTANCE_GROUP_LABEL).map(String::as_str)
                    == Some(name.as_str())
            })
            .count() as i32;
        if joined < group.spec.min_size {
            health.failures.push(HealthFailure {
                kind: "InstanceGroup".into(),
                name: name.clone(),
                message: format!(
                    "InstanceGroup {name:?} did not have enough nodes {joined} vs {}",
                    group.spec.min_size
                ),
            });
        }
    }

    for node in nodes {
        let status = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
            .map(|c| match c.status.as_str() {
                "True" => NodeReadiness::True,
                "False" => NodeReadiness::False,
                _ => NodeReadiness::Unknown,
            })
            .unwrap_or(NodeReadiness::Unknown);
        health.nodes.push(NodeHealth {
            hostname: node.name_any(),
            status,
        });
    }

    health
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use kube::api::ObjectMeta;

    use super::*;
    use crate::api::cluster::InstanceGroupSpec;
    use crate::api::kops_cluster::build_instance_group;

    fn node(name: &str, group: &str, ready: &str) -> Node {
        let mut labels = BTreeMap::new();
        labels.insert(INSTANCE_GROUP_LABEL.to_string(), group.to_string());
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: ready.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn group(name: &str, min_size: i32) -> InstanceGroup {
        let mut node_labels = BTreeMap::new();
        node_labels.insert(INSTANCE_GROUP_LABEL.to_string(), name.to_string());
        build_instance_group(&InstanceGroupSpec {
            min_size,
            max_size: min_size,
            node_labels,
            ..Default::default()
        })
    }

    #[test]
    fn underfilled_group_is_a_structural_failure() {
        let health = reduce_health(&[node("n1", "nodes", "True")], &[group("nodes", 3)]);
        assert_eq!(health.failures.len(), 1);
        assert!(health.failures[0].message.contains("1 vs 3"));
    }

    #[test]
    fn satisfied_group_with_ready_nodes_is_healthy() {
        let health = reduce_health(&[node("n1", "nodes", "True")], &[group("nodes", 1)]);
        assert!(health.failures.is_empty());
        assert_eq!(health.nodes.len(), 1);
        assert_eq!(health.nodes[0].status, NodeReadiness::True);
    }

    #[test]
    fn readiness_maps_explicit_false_and_unknown() {
        let health = reduce_health(
            &[node("n1", "nodes", "False"), node("n2", "nodes", "Unknown")],
            &[],
        );
        assert_eq!(health.nodes[0].status, NodeReadiness::False);
        assert_eq!(health.nodes[1].status, NodeReadiness::Unknown);
    }
}
