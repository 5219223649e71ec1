//! State comparison between desired and observed configuration.

use crate::api::cluster::{ClusterSpec, InstanceGroup, InstanceGroupSpec};

/// Structural equality after normalizing server-assigned fields on the
/// observed spec. `config_base` and `master_public_name` are derived by the
/// backend and never part of desired intent.
pub fn cluster_up_to_date(desired: &ClusterSpec, observed: &ClusterSpec) -> bool {
    let mut observed = observed.clone();
    observed.config_base = None;
    observed.master_public_name = None;
    *desired == observed
}

/// Instance group drift between desired and observed sets, matched by the
/// instancegroup label. Groups without the label on either side are skipped.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceGroupChanges {
    /// Desired groups with no observed counterpart.
    pub added: Vec<String>,
    /// Observed groups with no desired counterpart.
    pub removed: Vec<String>,
    /// Label-matched pairs whose specs differ structurally.
    pub changed: Vec<String>,
}

impl InstanceGroupChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub fn instance_group_changes(
    desired: &[InstanceGroupSpec],
    observed: &[InstanceGroup],
) -> InstanceGroupChanges {
    let mut changes = InstanceGroupChanges::default();

    for spec in desired {
        let Some(name) = spec.group_name() else {
            continue;
        };
        match observed
            .iter()
            .find(|ig| ig.spec.group_name() == Some(name))
        {
            Some(ig) if ig.spec != *spec => changes.changed.push(name.to_string()),
            Some(_) => {}
            None => changes.added.push(name.to_string()),
        }
    }

    for ig in observed {
        let Some(name) = ig.spec.group_name() else {
            continue;
        };
        if !desired.iter().any(|spec| spec.group_name() == Some(name)) {
            changes.removed.push(name.to_string());
        }
    }

    changes
}

/// Historical matched-pairs comparison: only label-matched pairs are diffed,
/// so groups present on one side only never report drift. Kept because the
/// asymmetry is observable behavior consumers may rely on; the engine itself
/// counts additions and removals as drift.
pub fn instance_groups_up_to_date(
    desired: &[InstanceGroupSpec],
    observed: &[InstanceGroup],
) -> bool {
    instance_group_changes(desired, observed).changed.is_empty()
}
