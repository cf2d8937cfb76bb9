//! Reconciler
//!
//! One convergence pass per queued volume key: fetch the volume, resolve
//! the desired sub-resource set, observe what exists, apply the difference,
//! derive status from a fresh observation, and report how the pass should
//! be rescheduled. Every step is idempotent; a pass interrupted anywhere
//! leaves a state the next pass converges from.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{
    ConditionStatus, JivaVolume, ReplicaSyncState, VolumeCondition, VolumePhase,
    CONDITION_SPEC_VALID,
};
use crate::domain::{
    EventSeverity, EventSinkRef, ObservedSubResource, OwnerInfo, ReplicaApiStatus,
    ReplicaProbeRef, SubResourceKind, SubResourceStoreRef, VolumeKey, VolumeStoreRef,
    WorkloadHealth,
};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::reconcile::diff::{self, Plan};
use crate::reconcile::resolver::{self, DesiredState};
use crate::reconcile::status::{aggregate, ObservedVolume, ReplicaObservation};

// =============================================================================
// Outcome
// =============================================================================

/// How a finished pass should be rescheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged or terminal; wait for the next watch trigger
    Done,
    /// Still converging; check again after the given delay
    RequeueAfter(Duration),
}

/// Teardown stages. The second stage starts only once the first is fully
/// gone, so the controller never outlives a pass in which replicas still
/// hold data claims.
const TEARDOWN_STAGES: [[SubResourceKind; 2]; 2] = [
    [
        SubResourceKind::ReplicaWorkload,
        SubResourceKind::VolumeClaim,
    ],
    [
        SubResourceKind::ControllerWorkload,
        SubResourceKind::ControllerService,
    ],
];

// =============================================================================
// Reconciler
// =============================================================================

/// Drives one volume toward its declared state per pass
pub struct Reconciler {
    config: OperatorConfig,
    volumes: VolumeStoreRef,
    subresources: SubResourceStoreRef,
    probe: ReplicaProbeRef,
    events: EventSinkRef,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(
        config: OperatorConfig,
        volumes: VolumeStoreRef,
        subresources: SubResourceStoreRef,
        probe: ReplicaProbeRef,
        events: EventSinkRef,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            volumes,
            subresources,
            probe,
            events,
            metrics,
        }
    }

    /// Run one pass for the given volume key
    pub async fn reconcile(&self, key: &VolumeKey) -> Result<Outcome> {
        let Some(volume) = self.volumes.get(key).await? else {
            debug!(%key, "volume gone, nothing to reconcile");
            self.metrics.forget_volume(key);
            return Ok(Outcome::Done);
        };

        if volume.deletion_requested() {
            self.teardown(key, volume).await
        } else {
            self.converge(key, volume).await
        }
    }

    // =========================================================================
    // Convergence
    // =========================================================================

    async fn converge(&self, key: &VolumeKey, volume: JivaVolume) -> Result<Outcome> {
        // The finalizer goes on before anything is created so teardown can
        // never be skipped.
        let volume = self.volumes.ensure_finalizer(&volume).await?;
        let owner = OwnerInfo::for_volume(&volume)
            .ok_or_else(|| Error::Internal(format!("volume {} missing identity metadata", key)))?;

        let desired = match resolver::resolve(key, &volume.spec, &self.config.engine) {
            Ok(desired) => desired,
            Err(err) if !err.is_retryable() => return self.mark_invalid(key, &volume, err).await,
            Err(err) => return Err(err),
        };

        let observed = self.observe_all(key).await?;
        let plan = diff::plan(&desired, &observed);
        if !plan.is_empty() {
            debug!(
                %key,
                creates = plan.creates.len(),
                updates = plan.updates.len(),
                deletes = plan.deletes.len(),
                "applying plan"
            );
        }
        self.apply(key, &owner, &volume, &plan).await?;

        // Status comes from a fresh read so objects applied above count
        let observation = self.observe_volume(key, &desired).await?;
        let status = aggregate(
            &key.name,
            volume.replication_factor(),
            &observation,
            volume.status.as_ref(),
            self.config.controller_retry_budget,
            Utc::now(),
        );

        self.transition_events(&volume, &status);
        let phase = status.phase;
        if volume.status.as_ref() != Some(&status) {
            self.volumes.update_status(&volume, status).await?;
        }
        self.metrics.observe_phase(key, phase);

        match phase {
            VolumePhase::Ready | VolumePhase::Failed => Ok(Outcome::Done),
            _ => Ok(Outcome::RequeueAfter(self.config.requeue_converging)),
        }
    }

    /// Observation across every kind, for planning. Terminating entries are
    /// included; the planner knows to leave them alone.
    async fn observe_all(&self, key: &VolumeKey) -> Result<Vec<ObservedSubResource>> {
        let mut observed = Vec::new();
        for kind in resolver::APPLY_KIND_ORDER {
            observed.extend(self.subresources.list_owned(kind, key).await?);
        }
        Ok(observed)
    }

    async fn apply(
        &self,
        key: &VolumeKey,
        owner: &OwnerInfo,
        volume: &JivaVolume,
        plan: &Plan,
    ) -> Result<()> {
        if !plan.creates.is_empty() {
            self.events.publish(
                volume,
                EventSeverity::Normal,
                "Provisioning",
                &format!("creating {} sub-resources", plan.creates.len()),
            );
        }
        for spec in &plan.creates {
            self.subresources.create(owner, spec).await?;
        }
        for update in &plan.updates {
            self.subresources
                .update(owner, &update.spec, update.resource_version.clone())
                .await?;
        }
        if !plan.deletes.is_empty() {
            self.events.publish(
                volume,
                EventSeverity::Normal,
                "ScaleDown",
                &format!("removing {} excess sub-resources", plan.deletes.len()),
            );
        }
        for delete in &plan.deletes {
            self.subresources
                .delete(delete.kind, key, &delete.name)
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Health Observation
    // =========================================================================

    async fn observe_volume(
        &self,
        key: &VolumeKey,
        desired: &DesiredState,
    ) -> Result<ObservedVolume> {
        let controller = self
            .subresources
            .get(
                SubResourceKind::ControllerWorkload,
                key,
                &desired.controller.name,
            )
            .await?
            .filter(|c| !c.terminating)
            .map(|c| c.health);

        let endpoint = self
            .subresources
            .get(SubResourceKind::ControllerService, key, &desired.service.name)
            .await?
            .filter(|s| !s.terminating)
            .and_then(|s| s.address);

        let mut replicas: Vec<ObservedSubResource> = self
            .subresources
            .list_owned(SubResourceKind::ReplicaWorkload, key)
            .await?
            .into_iter()
            .filter(|r| !r.terminating)
            .collect();
        // Index order: rep-2 sorts before rep-10
        replicas.sort_by(|a, b| {
            (a.spec.name.len(), &a.spec.name).cmp(&(b.spec.name.len(), &b.spec.name))
        });

        let controller_ready = controller == Some(WorkloadHealth::Ready);
        let replicas = self
            .replica_observations(key, controller_ready, endpoint.as_deref(), replicas)
            .await;

        Ok(ObservedVolume {
            controller,
            endpoint,
            replicas,
        })
    }

    /// Resolve per-replica sync states, preferring the controller's own
    /// replica listing. Probe failures downgrade to pod-derived states so
    /// status stays live through target API hiccups.
    async fn replica_observations(
        &self,
        key: &VolumeKey,
        controller_ready: bool,
        endpoint: Option<&str>,
        replicas: Vec<ObservedSubResource>,
    ) -> Vec<ReplicaObservation> {
        let listing = match (controller_ready, endpoint) {
            (true, Some(host)) => match self.probe.list_replicas(host).await {
                Ok(listing) => Some(listing),
                Err(err) => {
                    debug!(%key, error = %err, "replica probe failed, deriving sync from pod health");
                    None
                }
            },
            _ => None,
        };

        replicas
            .into_iter()
            .map(|replica| {
                let sync = replica_sync_state(&replica, listing.as_deref());
                ReplicaObservation {
                    name: replica.spec.name,
                    sync,
                    node: replica.node,
                }
            })
            .collect()
    }

    // =========================================================================
    // Invalid Spec
    // =========================================================================

    async fn mark_invalid(
        &self,
        key: &VolumeKey,
        volume: &JivaVolume,
        err: Error,
    ) -> Result<Outcome> {
        warn!(%key, error = %err, "volume spec rejected");
        self.events
            .publish(volume, EventSeverity::Warning, "InvalidSpec", &err.to_string());

        let mut status = volume.status.clone().unwrap_or_default();
        status.phase = VolumePhase::Failed;
        status.set_condition(VolumeCondition {
            r#type: CONDITION_SPEC_VALID.to_string(),
            status: ConditionStatus::False,
            last_transition_time: Some(Utc::now()),
            reason: Some("ValidationFailed".to_string()),
            message: Some(err.to_string()),
        });
        if volume.status.as_ref() != Some(&status) {
            self.volumes.update_status(volume, status).await?;
        }
        self.metrics.observe_phase(key, VolumePhase::Failed);
        // Only a spec edit can unwedge this volume; the watch will re-queue it
        Ok(Outcome::Done)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    async fn teardown(&self, key: &VolumeKey, volume: JivaVolume) -> Result<Outcome> {
        if !volume.has_finalizer() {
            self.metrics.forget_volume(key);
            return Ok(Outcome::Done);
        }

        if volume.status.as_ref().map(|s| s.phase) != Some(VolumePhase::Deleting) {
            let mut status = volume.status.clone().unwrap_or_default();
            status.phase = VolumePhase::Deleting;
            self.events.publish(
                &volume,
                EventSeverity::Normal,
                "Deleting",
                "tearing down volume sub-resources",
            );
            self.volumes.update_status(&volume, status).await?;
        }
        self.metrics.observe_phase(key, VolumePhase::Deleting);

        for stage in TEARDOWN_STAGES {
            let mut remaining = 0;
            for kind in stage {
                let observed = self.subresources.list_owned(kind, key).await?;
                for sub in &observed {
                    if !sub.terminating {
                        self.subresources.delete(kind, key, &sub.spec.name).await?;
                    }
                }
                remaining += observed.len();
            }
            if remaining > 0 {
                return Err(Error::DeletionPending {
                    volume: key.name.clone(),
                    remaining,
                });
            }
        }

        self.events.publish(
            &volume,
            EventSeverity::Normal,
            "Deleted",
            "all sub-resources removed",
        );
        self.volumes.remove_finalizer(&volume).await?;
        self.metrics.forget_volume(key);
        info!(%key, "volume torn down");
        Ok(Outcome::Done)
    }

    // =========================================================================
    // Events
    // =========================================================================

    fn transition_events(&self, volume: &JivaVolume, status: &crate::crd::JivaVolumeStatus) {
        if volume.status.as_ref().map(|s| s.phase) == Some(status.phase) {
            return;
        }
        match status.phase {
            VolumePhase::Ready => self.events.publish(
                volume,
                EventSeverity::Normal,
                "VolumeReady",
                "all replicas in sync",
            ),
            VolumePhase::Degraded => {
                let in_sync = status
                    .replicas
                    .iter()
                    .filter(|r| r.sync_state == ReplicaSyncState::InSync)
                    .count();
                self.events.publish(
                    volume,
                    EventSeverity::Warning,
                    "VolumeDegraded",
                    &format!(
                        "{} of {} replicas in sync",
                        in_sync,
                        volume.replication_factor()
                    ),
                );
            }
            VolumePhase::Failed => self.events.publish(
                volume,
                EventSeverity::Warning,
                "VolumeFailed",
                "controller has been unreachable beyond the retry budget",
            ),
            _ => {}
        }
    }
}

/// Sync state for one replica workload, from the controller listing when
/// available and pod health otherwise
fn replica_sync_state(
    replica: &ObservedSubResource,
    listing: Option<&[ReplicaApiStatus]>,
) -> ReplicaSyncState {
    match replica.health {
        WorkloadHealth::CrashLoop => ReplicaSyncState::Error,
        WorkloadHealth::Pending | WorkloadHealth::Unknown => ReplicaSyncState::New,
        WorkloadHealth::Running | WorkloadHealth::Ready => match listing {
            Some(listing) => {
                let address = replica.address.as_deref().unwrap_or_default();
                listing
                    .iter()
                    .find(|entry| !address.is_empty() && entry.address.contains(address))
                    .map(|entry| entry.mode.sync_state())
                    // Running but not registered with the controller yet
                    .unwrap_or(ReplicaSyncState::Syncing)
            }
            None => {
                if replica.health == WorkloadHealth::Ready {
                    ReplicaSyncState::InSync
                } else {
                    ReplicaSyncState::Syncing
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        JivaVolumeSpec, CONDITION_CONTROLLER_HEALTHY, CONDITION_NO_HEALTHY_REPLICA,
    };
    use crate::domain::ReplicaMode;
    use crate::error::ErrorAction;
    use crate::events::MemoryEventSink;
    use crate::store::{InMemoryStore, ScriptedProbe, StoreOp};
    use assert_matches::assert_matches;
    use prometheus::Registry;

    struct Harness {
        reconciler: Reconciler,
        store: Arc<InMemoryStore>,
        probe: Arc<ScriptedProbe>,
        events: Arc<MemoryEventSink>,
        key: VolumeKey,
    }

    fn harness(spec: JivaVolumeSpec) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let probe = Arc::new(ScriptedProbe::new());
        let events = Arc::new(MemoryEventSink::new());
        let metrics = Arc::new(Metrics::new(&Registry::new()).unwrap());
        let key = store.put_volume(JivaVolume::new("pvc-1", spec));
        let reconciler = Reconciler::new(
            OperatorConfig::default(),
            store.clone(),
            store.clone(),
            probe.clone(),
            events.clone(),
            metrics,
        );
        Harness {
            reconciler,
            store,
            probe,
            events,
            key,
        }
    }

    fn default_spec() -> JivaVolumeSpec {
        JivaVolumeSpec {
            capacity: "5Gi".into(),
            ..Default::default()
        }
    }

    fn in_sync_listing() -> Vec<(String, ReplicaMode)> {
        (0..3)
            .map(|i| {
                (
                    format!("tcp://pvc-1-jiva-rep-{}:9502", i),
                    ReplicaMode::RW,
                )
            })
            .collect()
    }

    fn creates_of(trace: &[StoreOp]) -> Vec<(SubResourceKind, String)> {
        trace
            .iter()
            .filter_map(|op| match op {
                StoreOp::Create { kind, name } => Some((*kind, name.clone())),
                _ => None,
            })
            .collect()
    }

    fn deletes_of(trace: &[StoreOp]) -> Vec<(SubResourceKind, String)> {
        trace
            .iter()
            .filter_map(|op| match op {
                StoreOp::Delete { kind, name } => Some((*kind, name.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_pass_provisions_full_set() {
        let h = harness(default_spec());

        let outcome = h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(outcome, Outcome::RequeueAfter(Duration::from_secs(5)));

        let trace = h.store.take_trace();
        assert_eq!(trace[0], StoreOp::FinalizerAdded);

        let creates = creates_of(&trace);
        assert_eq!(creates.len(), 8);
        // Frontend first, then controller, then storage, then replicas
        assert_eq!(creates[0].0, SubResourceKind::ControllerService);
        assert_eq!(creates[1].0, SubResourceKind::ControllerWorkload);
        assert!(creates[2..5]
            .iter()
            .all(|(kind, _)| *kind == SubResourceKind::VolumeClaim));
        assert!(creates[5..]
            .iter()
            .all(|(kind, _)| *kind == SubResourceKind::ReplicaWorkload));

        let status = h.store.volume(&h.key).unwrap().status.unwrap();
        assert_eq!(status.phase, VolumePhase::Creating);
        assert_eq!(status.replica_count, 3);
        assert!(h.events.has_reason("Provisioning"));
    }

    #[tokio::test]
    async fn test_steady_state_pass_writes_nothing() {
        let h = harness(default_spec());
        h.reconciler.reconcile(&h.key).await.unwrap();
        h.store.take_trace();

        h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(h.store.take_trace(), vec![]);
    }

    #[tokio::test]
    async fn test_convergence_to_ready() {
        let h = harness(default_spec());
        h.reconciler.reconcile(&h.key).await.unwrap();
        h.store.make_all_ready();
        h.probe.set_replicas(in_sync_listing());

        let outcome = h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(outcome, Outcome::Done);

        let status = h.store.volume(&h.key).unwrap().status.unwrap();
        assert_eq!(status.phase, VolumePhase::Ready);
        assert_eq!(status.replica_count, 3);
        assert!(status
            .replicas
            .iter()
            .all(|r| r.sync_state == ReplicaSyncState::InSync));
        assert_eq!(status.iqn.as_deref(), Some("iqn.2016-09.com.openebs.jiva:pvc-1"));
        let target = status.target_address.clone().unwrap();
        assert!(target.ends_with(":3260"), "target {}", target);

        let healthy = status.condition(CONDITION_CONTROLLER_HEALTHY).unwrap();
        assert_eq!(healthy.status, ConditionStatus::True);
        assert!(status.condition(CONDITION_NO_HEALTHY_REPLICA).is_none());
        assert!(h.events.has_reason("VolumeReady"));
    }

    #[tokio::test]
    async fn test_one_faulted_replica_degrades_without_no_healthy_replica() {
        let h = harness(default_spec());
        h.reconciler.reconcile(&h.key).await.unwrap();
        h.store.make_all_ready();
        let mut listing = in_sync_listing();
        listing[2].1 = ReplicaMode::ERR;
        h.probe.set_replicas(listing);

        h.reconciler.reconcile(&h.key).await.unwrap();

        let status = h.store.volume(&h.key).unwrap().status.unwrap();
        assert_eq!(status.phase, VolumePhase::Degraded);
        assert!(status.condition(CONDITION_NO_HEALTHY_REPLICA).is_none());
        assert!(h.events.has_reason("VolumeDegraded"));
    }

    #[tokio::test]
    async fn test_zero_in_sync_raises_no_healthy_replica() {
        let h = harness(default_spec());
        h.reconciler.reconcile(&h.key).await.unwrap();
        h.store.make_all_ready();
        h.probe.set_replicas(
            in_sync_listing()
                .into_iter()
                .map(|(addr, _)| (addr, ReplicaMode::ERR))
                .collect(),
        );

        h.reconciler.reconcile(&h.key).await.unwrap();

        let status = h.store.volume(&h.key).unwrap().status.unwrap();
        assert_eq!(status.phase, VolumePhase::Degraded);
        let cond = status.condition(CONDITION_NO_HEALTHY_REPLICA).unwrap();
        assert_eq!(cond.status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn test_probe_outage_falls_back_to_pod_health() {
        let h = harness(default_spec());
        h.reconciler.reconcile(&h.key).await.unwrap();
        h.store.make_all_ready();
        h.probe.set_unavailable(true);

        let outcome = h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        let status = h.store.volume(&h.key).unwrap().status.unwrap();
        assert_eq!(status.phase, VolumePhase::Ready);
    }

    #[tokio::test]
    async fn test_zero_replication_factor_fails_without_creates() {
        let h = harness(JivaVolumeSpec {
            capacity: "5Gi".into(),
            replication_factor: 0,
            ..Default::default()
        });

        let outcome = h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(outcome, Outcome::Done);

        let trace = h.store.take_trace();
        assert!(creates_of(&trace).is_empty());
        let status = h.store.volume(&h.key).unwrap().status.unwrap();
        assert_eq!(status.phase, VolumePhase::Failed);
        let cond = status.condition(CONDITION_SPEC_VALID).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert!(h.events.has_reason("InvalidSpec"));
    }

    #[tokio::test]
    async fn test_malformed_capacity_fails_terminally() {
        let h = harness(JivaVolumeSpec {
            capacity: "a lot".into(),
            ..Default::default()
        });

        let outcome = h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        let status = h.store.volume(&h.key).unwrap().status.unwrap();
        assert_eq!(status.phase, VolumePhase::Failed);
    }

    #[tokio::test]
    async fn test_scale_down_deletes_replica_before_claim() {
        let h = harness(default_spec());
        h.reconciler.reconcile(&h.key).await.unwrap();
        h.store.take_trace();

        let mut volume = h.store.volume(&h.key).unwrap();
        volume.spec.replication_factor = 2;
        h.store.put_volume(volume);

        h.reconciler.reconcile(&h.key).await.unwrap();

        let deletes = deletes_of(&h.store.take_trace());
        assert_eq!(
            deletes,
            vec![
                (
                    SubResourceKind::ReplicaWorkload,
                    "pvc-1-jiva-rep-2".to_string()
                ),
                (
                    SubResourceKind::VolumeClaim,
                    "pvc-1-jiva-rep-2-data".to_string()
                ),
            ]
        );
        assert_eq!(h.store.sub_names(SubResourceKind::ReplicaWorkload).len(), 2);
        assert_eq!(h.store.sub_names(SubResourceKind::VolumeClaim).len(), 2);
    }

    #[tokio::test]
    async fn test_controller_down_past_budget_fails() {
        let h = harness(default_spec());
        h.reconciler.reconcile(&h.key).await.unwrap();

        // Age the unhealthy condition past the retry budget
        let mut volume = h.store.volume(&h.key).unwrap();
        let status = volume.status.as_mut().unwrap();
        let cond = status
            .conditions
            .iter_mut()
            .find(|c| c.r#type == CONDITION_CONTROLLER_HEALTHY)
            .unwrap();
        cond.last_transition_time = Some(Utc::now() - chrono::Duration::minutes(10));
        h.store.put_volume(volume);

        let outcome = h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        let status = h.store.volume(&h.key).unwrap().status.unwrap();
        assert_eq!(status.phase, VolumePhase::Failed);
        assert!(h.events.has_reason("VolumeFailed"));
    }

    #[tokio::test]
    async fn test_teardown_runs_in_stages() {
        let h = harness(default_spec());
        h.reconciler.reconcile(&h.key).await.unwrap();
        h.store.take_trace();
        h.store.mark_deleted(&h.key);

        // Stage one: replicas and claims go, controller stays
        let err = h.reconciler.reconcile(&h.key).await.unwrap_err();
        assert_matches!(err, Error::DeletionPending { .. });
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);

        let trace = h.store.take_trace();
        assert!(trace.contains(&StoreOp::StatusWrite {
            phase: VolumePhase::Deleting
        }));
        let deletes = deletes_of(&trace);
        assert_eq!(deletes.len(), 6);
        assert!(deletes.iter().all(|(kind, _)| matches!(
            kind,
            SubResourceKind::ReplicaWorkload | SubResourceKind::VolumeClaim
        )));
        assert!(h
            .store
            .contains(SubResourceKind::ControllerWorkload, "pvc-1-jiva-ctrl"));

        // Stage two: controller and service go
        let err = h.reconciler.reconcile(&h.key).await.unwrap_err();
        assert_matches!(err, Error::DeletionPending { .. });
        let deletes = deletes_of(&h.store.take_trace());
        assert_eq!(deletes.len(), 2);
        assert!(deletes.iter().all(|(kind, _)| matches!(
            kind,
            SubResourceKind::ControllerWorkload | SubResourceKind::ControllerService
        )));

        // Everything gone: finalizer released, record collected
        let outcome = h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(h
            .store
            .take_trace()
            .contains(&StoreOp::FinalizerRemoved));
        assert!(h.store.volume(&h.key).is_none());
        assert!(h.events.has_reason("Deleted"));
    }

    #[tokio::test]
    async fn test_teardown_waits_on_stuck_delete_without_reissuing() {
        let h = harness(default_spec());
        h.reconciler.reconcile(&h.key).await.unwrap();
        h.store.mark_deleted(&h.key);
        h.store
            .sticky_delete(SubResourceKind::ControllerWorkload, "pvc-1-jiva-ctrl");

        // Two passes clear stage one and issue the stage-two deletes
        h.reconciler.reconcile(&h.key).await.unwrap_err();
        h.reconciler.reconcile(&h.key).await.unwrap_err();
        h.store.take_trace();

        // Controller stuck terminating: keep waiting, do not re-delete
        let err = h.reconciler.reconcile(&h.key).await.unwrap_err();
        assert_matches!(err, Error::DeletionPending { remaining: 1, .. });
        assert!(deletes_of(&h.store.take_trace()).is_empty());

        h.store
            .finish_delete(SubResourceKind::ControllerWorkload, "pvc-1-jiva-ctrl");
        let outcome = h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
    }

    #[tokio::test]
    async fn test_failed_pass_recovers_on_retry() {
        let h = harness(default_spec());
        h.store.fail_next_create();

        let err = h.reconciler.reconcile(&h.key).await.unwrap_err();
        assert!(err.is_retryable());

        h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(h.store.sub_names(SubResourceKind::ReplicaWorkload).len(), 3);
        assert_eq!(h.store.sub_names(SubResourceKind::VolumeClaim).len(), 3);
        assert!(h
            .store
            .contains(SubResourceKind::ControllerService, "pvc-1-jiva-ctrl-svc"));
    }

    #[tokio::test]
    async fn test_vanished_volume_is_done() {
        let h = harness(default_spec());
        let ghost = VolumeKey::new("openebs", "never-created");
        let outcome = h.reconciler.reconcile(&ghost).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(h.store.take_trace().is_empty());
    }

    #[tokio::test]
    async fn test_deletion_before_finalizer_needs_no_teardown() {
        let h = harness(default_spec());
        h.store.mark_deleted(&h.key);

        let outcome = h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(h.store.take_trace().is_empty());
    }
}
