//! Cluster health validation and its reduction to a pass/fail verdict.

use super::connection::ConnectionDescriptor;
use super::ValidationError;
use crate::api::cluster::{Cluster, InstanceGroup};
use crate::backend::{CloudProvider, ClusterHealth, HealthProbe, NodeReadiness};

/// Pass/fail verdict with ordered human-readable messages: structural
/// failures first in source order, then node messages in iteration order.
#[derive(Clone, Debug, Default)]
pub struct ValidationResult {
    pub ok: bool,
    pub messages: Vec<String>,
}

/// Queries live cluster health through the connection descriptor and reduces
/// it. Resolves a cloud handle for the cluster's provider and binds the probe
/// to the cluster, cloud and instance group tuple.
pub async fn validate<P, H>(
    probe: &H,
    provider: &P,
    conn: &ConnectionDescriptor,
    cluster: &Cluster,
    groups: &[InstanceGroup],
) -> Result<ValidationResult, ValidationError>
where
    P: CloudProvider,
    H: HealthProbe<P::Cloud>,
{
    let cloud = provider
        .build_cloud(cluster)
        .map_err(ValidationError::Cloud)?;
    let api_url = format!("https://api.{}:443", cluster.name());
    let health = probe
        .check(conn, cluster, &cloud, groups, &api_url)
        .await
        .map_err(ValidationError::Probe)?;
    Ok(reduce(&health))
}

/// Reduction rule: success only with zero structural failures and no node
/// whose readiness is explicitly `False`. Missing or unknown conditions are
/// not failures. Messages are not deduplicated.
pub fn reduce(health: &ClusterHealth) -> ValidationResult {
    let mut ok = true;
    let mut messages = Vec::new();

    for failure in &health.failures {
        ok = false;
        messages.push(failure.message.clone());
    }

    for node in &health.nodes {
        if node.status == NodeReadiness::False {
            ok = false;
            messages.push(format!(
                "node {} condition is {}",
                node.hostname, node.status
            ));
        }
    }

    ValidationResult { ok, messages }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HealthFailure, NodeHealth};

    fn failure(message: &str) -> HealthFailure {
        HealthFailure {
            kind: "InstanceGroup".into(),
            name: "nodes".into(),
            message: message.into(),
        }
    }

    fn node(hostname: &str, status: NodeReadiness) -> NodeHealth {
        NodeHealth {
            hostname: hostname.into(),
            status,
        }
    }

    #[test]
    fn healthy_cluster_passes() {
        let result = reduce(&ClusterHealth {
            failures: vec![],
            nodes: vec![node("n1", NodeReadiness::True)],
        });
        assert!(result.ok);
        assert!(result.messages.is_empty());
    }

    #[test]
    fn any_failure_forces_overall_fail() {
        let result = reduce(&ClusterHealth {
            failures: vec![failure("machine not yet joined")],
            nodes: vec![node("n1", NodeReadiness::True)],
        });
        assert!(!result.ok);
        assert_eq!(result.messages, vec!["machine not yet joined"]);
    }

    #[test]
    fn explicit_false_readiness_fails_even_without_failures() {
        let result = reduce(&ClusterHealth {
            failures: vec![],
            nodes: vec![node("n1", NodeReadiness::False)],
        });
        assert!(!result.ok);
        assert_eq!(result.messages, vec!["node n1 condition is False"]);
    }

    #[test]
    fn unknown_readiness_is_not_a_failure() {
        let result = reduce(&ClusterHealth {
            failures: vec![],
            nodes: vec![node("n1", NodeReadiness::Unknown)],
        });
        assert!(result.ok);
    }

    #[test]
    fn failures_precede_node_messages_without_dedup() {
        let result = reduce(&ClusterHealth {
            failures: vec![failure("a"), failure("a")],
            nodes: vec![
                node("n1", NodeReadiness::False),
                node("n2", NodeReadiness::False),
            ],
        });
        assert_eq!(
            result.messages,
            vec![
                "a",
                "a",
                "node n1 condition is False",
                "node n2 condition is False"
            ]
        );
    }
}
