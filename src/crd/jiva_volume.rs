//! JivaVolume CRD
//!
//! Declarative record for one jiva block volume: the desired topology
//! (capacity, replication factor, placement hints) and the observed status
//! the reconciler writes back (phase, per-replica sync state, iSCSI target).

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finalizer held on every JivaVolume while its sub-resources exist
pub const JIVA_VOLUME_FINALIZER: &str = "jivavolume.openebs.io/finalizer";

/// Condition type reporting controller reachability
pub const CONDITION_CONTROLLER_HEALTHY: &str = "ControllerHealthy";

/// Condition type raised when no replica is InSync; downstream consumers
/// must refuse new mounts while this is True
pub const CONDITION_NO_HEALTHY_REPLICA: &str = "NoHealthyReplica";

/// Condition type recording spec validation; False means the volume cannot
/// be provisioned until the spec is corrected
pub const CONDITION_SPEC_VALID: &str = "SpecValid";

// =============================================================================
// JivaVolume CRD
// =============================================================================

/// JivaVolume describes a replicated block volume served by one jiva
/// controller and a set of replica processes holding the data copies.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "JivaVolume",
    plural = "jivavolumes",
    shortname = "jv",
    status = "JivaVolumeStatus",
    printcolumn = r#"{"name": "Capacity", "type": "string", "jsonPath": ".spec.capacity"}"#,
    printcolumn = r#"{"name": "Factor", "type": "integer", "jsonPath": ".spec.replicationFactor"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Target", "type": "string", "jsonPath": ".status.targetAddress"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct JivaVolumeSpec {
    /// Requested capacity as a Kubernetes quantity (e.g. "10Gi")
    pub capacity: String,

    /// Number of replica processes backing the volume (>= 1)
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,

    /// Storage class for the backing claims; operator default when unset
    #[serde(default)]
    pub storage_class: Option<String>,

    /// Node selector applied to replica pods (placement hints)
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Additional engine parameters passed through to the workloads
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Default for JivaVolumeSpec {
    fn default() -> Self {
        Self {
            capacity: String::new(),
            replication_factor: default_replication_factor(),
            storage_class: None,
            node_selector: BTreeMap::new(),
            parameters: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a JivaVolume, derived from observed sub-resource state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VolumePhase {
    #[default]
    Pending,
    Creating,
    Ready,
    Degraded,
    Failed,
    Deleting,
}

impl std::fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumePhase::Pending => write!(f, "Pending"),
            VolumePhase::Creating => write!(f, "Creating"),
            VolumePhase::Ready => write!(f, "Ready"),
            VolumePhase::Degraded => write!(f, "Degraded"),
            VolumePhase::Failed => write!(f, "Failed"),
            VolumePhase::Deleting => write!(f, "Deleting"),
        }
    }
}

// =============================================================================
// Replica State
// =============================================================================

/// Sync state of one replica relative to the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ReplicaSyncState {
    /// Created but not yet registered with the controller
    #[default]
    New,
    /// Registered, rebuilding data from the controller
    Syncing,
    /// Fully synced, serving reads and writes
    InSync,
    /// Registered but faulted
    Error,
}

impl std::fmt::Display for ReplicaSyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaSyncState::New => write!(f, "New"),
            ReplicaSyncState::Syncing => write!(f, "Syncing"),
            ReplicaSyncState::InSync => write!(f, "InSync"),
            ReplicaSyncState::Error => write!(f, "Error"),
        }
    }
}

/// Observed state of one replica, reported in the volume status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    /// Replica workload name (index-based, stable across passes)
    pub name: String,

    /// Sync state relative to the controller
    pub sync_state: ReplicaSyncState,

    /// Node the replica pod is scheduled on, when known
    #[serde(default)]
    pub node: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the JivaVolume, owned exclusively by the reconciler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JivaVolumeStatus {
    /// Current phase
    #[serde(default)]
    pub phase: VolumePhase,

    /// Number of replica workloads currently observed
    #[serde(default)]
    pub replica_count: u32,

    /// Per-replica observed state
    #[serde(default)]
    pub replicas: Vec<ReplicaStatus>,

    /// iSCSI target portal ("clusterIP:3260") once the service has an address
    #[serde(default)]
    pub target_address: Option<String>,

    /// iSCSI qualified name for the volume
    #[serde(default)]
    pub iqn: Option<String>,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<VolumeCondition>,
}

/// Condition for volume status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCondition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// Condition status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

// =============================================================================
// Defaults
// =============================================================================

fn default_replication_factor() -> u32 {
    3
}

// =============================================================================
// Helpers
// =============================================================================

impl JivaVolume {
    /// Replication factor requested by the spec
    pub fn replication_factor(&self) -> u32 {
        self.spec.replication_factor
    }

    /// Whether deletion has been requested for this volume
    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the operator's finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == JIVA_VOLUME_FINALIZER))
            .unwrap_or(false)
    }
}

impl JivaVolumeStatus {
    /// Set a condition, replacing existing if same type. The transition
    /// timestamp carries over when the condition value is unchanged so a
    /// steady state stays byte-identical across passes.
    pub fn set_condition(&mut self, mut condition: VolumeCondition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    /// Look up a condition by type
    pub fn condition(&self, r#type: &str) -> Option<&VolumeCondition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    /// Check if the volume is serving at full replication
    pub fn is_ready(&self) -> bool {
        self.phase == VolumePhase::Ready
    }
}

/// iSCSI qualified name for a volume, matching the jiva engine convention
pub fn volume_iqn(volume: &str) -> String {
    format!("iqn.2016-09.com.openebs.jiva:{}", volume)
}
