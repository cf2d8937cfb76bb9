//! Status Aggregator
//!
//! Deterministic fold of observed sub-resource health into the volume-level
//! status. Phase is a pure function of the observation plus the previous
//! conditions (needed only for transition timestamps and the controller
//! retry budget); aggregating the same inputs twice yields identical status,
//! which lets the reconciler skip no-op status writes.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::crd::{
    volume_iqn, ConditionStatus, JivaVolumeStatus, ReplicaStatus, ReplicaSyncState,
    VolumeCondition, VolumePhase, CONDITION_CONTROLLER_HEALTHY, CONDITION_NO_HEALTHY_REPLICA,
};
use crate::domain::WorkloadHealth;
use crate::reconcile::resolver::ISCSI_PORT;

// =============================================================================
// Observation Model
// =============================================================================

/// One replica as observed after the pass's corrective actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaObservation {
    pub name: String,
    pub sync: ReplicaSyncState,
    pub node: Option<String>,
}

/// Everything the aggregator needs about one volume's sub-resources.
/// Terminating sub-resources are excluded before this is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedVolume {
    /// Health of the controller workload; None when it does not exist
    pub controller: Option<WorkloadHealth>,
    /// Cluster IP assigned to the controller service
    pub endpoint: Option<String>,
    /// Replica observations in stable name order
    pub replicas: Vec<ReplicaObservation>,
}

// =============================================================================
// Aggregation
// =============================================================================

/// Fold an observation into the volume status.
///
/// Verdicts, in order:
/// - nothing observed at all -> Pending
/// - controller absent or not Ready -> Creating, or Failed once the
///   ControllerHealthy=False condition has persisted beyond `budget`
/// - controller Ready, every one of `replication_factor` replicas InSync -> Ready
/// - controller Ready otherwise -> Degraded, with NoHealthyReplica raised
///   when zero replicas are InSync
pub fn aggregate(
    volume: &str,
    replication_factor: u32,
    observed: &ObservedVolume,
    prev: Option<&JivaVolumeStatus>,
    budget: Duration,
    now: DateTime<Utc>,
) -> JivaVolumeStatus {
    let mut status = JivaVolumeStatus {
        phase: VolumePhase::Pending,
        replica_count: observed.replicas.len() as u32,
        replicas: observed
            .replicas
            .iter()
            .map(|r| ReplicaStatus {
                name: r.name.clone(),
                sync_state: r.sync,
                node: r.node.clone(),
            })
            .collect(),
        target_address: observed
            .endpoint
            .as_ref()
            .map(|ip| format!("{}:{}", ip, ISCSI_PORT)),
        iqn: Some(volume_iqn(volume)),
        conditions: Vec::new(),
    };

    if observed.controller.is_none() && observed.replicas.is_empty() {
        return status;
    }

    let controller_ready = observed.controller == Some(WorkloadHealth::Ready);
    if !controller_ready {
        let reason = match observed.controller {
            None => "ControllerMissing",
            Some(WorkloadHealth::CrashLoop) => "ControllerCrashLoop",
            _ => "ControllerStarting",
        };
        let down_since = push_condition(
            &mut status,
            prev,
            CONDITION_CONTROLLER_HEALTHY,
            ConditionStatus::False,
            reason,
            "controller is not serving I/O",
            now,
        );

        let down_for = now
            .signed_duration_since(down_since)
            .to_std()
            .unwrap_or_default();
        status.phase = if down_for >= budget {
            VolumePhase::Failed
        } else {
            VolumePhase::Creating
        };
        return status;
    }

    push_condition(
        &mut status,
        prev,
        CONDITION_CONTROLLER_HEALTHY,
        ConditionStatus::True,
        "ControllerReady",
        "controller is serving I/O",
        now,
    );

    let in_sync = observed
        .replicas
        .iter()
        .filter(|r| r.sync == ReplicaSyncState::InSync)
        .count() as u32;

    if status.replica_count == replication_factor && in_sync == replication_factor {
        status.phase = VolumePhase::Ready;
    } else {
        status.phase = VolumePhase::Degraded;
        if in_sync == 0 {
            push_condition(
                &mut status,
                prev,
                CONDITION_NO_HEALTHY_REPLICA,
                ConditionStatus::True,
                "AllReplicasOutOfSync",
                "no replica is InSync; refuse new mounts",
                now,
            );
        }
    }

    status
}

/// Append a condition, carrying the previous transition time forward when
/// the value is unchanged. Returns the effective transition time.
fn push_condition(
    status: &mut JivaVolumeStatus,
    prev: Option<&JivaVolumeStatus>,
    r#type: &str,
    value: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let transition = prev
        .and_then(|p| p.condition(r#type))
        .filter(|c| c.status == value)
        .and_then(|c| c.last_transition_time)
        .unwrap_or(now);
    status.set_condition(VolumeCondition {
        r#type: r#type.to_string(),
        status: value,
        last_transition_time: Some(transition),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    });
    transition
}
