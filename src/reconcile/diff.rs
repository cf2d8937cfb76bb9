//! Convergence planning
//!
//! Compares the resolved desired state against the observed sub-resource set
//! and produces an ordered plan: creates before updates before deletes, the
//! controller's service and workload ahead of replicas, and teardown-side
//! deletes with replicas ahead of the controller.

use std::collections::BTreeMap;

use crate::domain::{ObservedSubResource, SubResourceConfig, SubResourceKind, SubResourceSpec};
use crate::reconcile::resolver::{DesiredState, APPLY_KIND_ORDER};

/// Kinds in the order deletes are issued: data-plane drains first
pub const DELETE_KIND_ORDER: [SubResourceKind; 4] = [
    SubResourceKind::ReplicaWorkload,
    SubResourceKind::VolumeClaim,
    SubResourceKind::ControllerWorkload,
    SubResourceKind::ControllerService,
];

/// An in-place update of a diverged sub-resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUpdate {
    pub spec: SubResourceSpec,
    /// Last-observed version, echoed for conflict detection
    pub resource_version: Option<String>,
}

/// Deletion of a sub-resource no longer desired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDelete {
    pub kind: SubResourceKind,
    pub name: String,
}

/// Ordered corrective actions for one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub creates: Vec<SubResourceSpec>,
    pub updates: Vec<PlannedUpdate>,
    pub deletes: Vec<PlannedDelete>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }
}

/// Compute the missing / divergent / extra partition of the observed set.
///
/// A terminating sub-resource is treated as still present: its name is not
/// re-created (the store would refuse anyway) and it is never re-deleted.
/// The following pass picks it up once termination finishes.
pub fn plan(desired: &DesiredState, observed: &[ObservedSubResource]) -> Plan {
    let by_key: BTreeMap<(SubResourceKind, &str), &ObservedSubResource> = observed
        .iter()
        .map(|o| ((o.spec.kind, o.spec.name.as_str()), o))
        .collect();

    let mut out = Plan::default();

    for kind in APPLY_KIND_ORDER {
        for want in desired.of_kind(kind) {
            match by_key.get(&(kind, want.name.as_str())) {
                None => out.creates.push((*want).clone()),
                Some(have) if !have.terminating && update_needed(want, &have.spec) => {
                    out.updates.push(PlannedUpdate {
                        spec: (*want).clone(),
                        resource_version: have.resource_version.clone(),
                    });
                }
                Some(_) => {}
            }
        }
    }

    for kind in DELETE_KIND_ORDER {
        let wanted: Vec<&str> = desired
            .of_kind(kind)
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        for have in observed.iter().filter(|o| o.spec.kind == kind) {
            if !wanted.contains(&have.spec.name.as_str()) && !have.terminating {
                out.deletes.push(PlannedDelete {
                    kind,
                    name: have.spec.name.clone(),
                });
            }
        }
    }

    out
}

/// Whether an observed sub-resource diverges from the desired config in a
/// way this operator applies in place. Claims are special: storage cannot
/// shrink and the class is immutable, so only capacity growth is actionable.
fn update_needed(want: &SubResourceSpec, have: &SubResourceSpec) -> bool {
    match (&want.config, &have.config) {
        (SubResourceConfig::Claim(w), SubResourceConfig::Claim(h)) => {
            w.capacity_bytes > h.capacity_bytes
        }
        (w, h) => w != h,
    }
}
