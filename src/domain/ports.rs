//! Domain Ports - Core trait definitions for the JivaVolume operator
//!
//! These traits define the boundaries between the reconciliation logic and
//! external systems. The reconciler depends only on these interfaces; one
//! adapter per backing technology implements them.

use crate::crd::{JivaVolume, JivaVolumeStatus, ReplicaSyncState};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Volume Key
// =============================================================================

/// Identity of one volume: the unit of reconciliation and queue coalescing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeKey {
    pub namespace: String,
    pub name: String,
}

impl VolumeKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a volume resource, if it carries both namespace and name
    pub fn for_volume(volume: &JivaVolume) -> Option<Self> {
        match (&volume.metadata.namespace, &volume.metadata.name) {
            (Some(ns), Some(name)) => Some(Self::new(ns, name)),
            _ => None,
        }
    }
}

impl std::fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Ownership data stamped onto every created sub-resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerInfo {
    pub key: VolumeKey,
    pub uid: String,
}

impl OwnerInfo {
    /// Owner info for a volume the store has already fetched
    pub fn for_volume(volume: &JivaVolume) -> Option<Self> {
        let key = VolumeKey::for_volume(volume)?;
        let uid = volume.metadata.uid.clone()?;
        Some(Self { key, uid })
    }
}

// =============================================================================
// Sub-Resource Descriptors
// =============================================================================

/// Kinds of sub-resources the reconciler manages through the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubResourceKind {
    /// The single controller workload serving I/O
    ControllerWorkload,
    /// The service exposing the controller's iSCSI portal and REST API
    ControllerService,
    /// One replica workload holding a data copy
    ReplicaWorkload,
    /// The backing persistent claim for one replica
    VolumeClaim,
}

impl std::fmt::Display for SubResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubResourceKind::ControllerWorkload => write!(f, "controller-workload"),
            SubResourceKind::ControllerService => write!(f, "controller-service"),
            SubResourceKind::ReplicaWorkload => write!(f, "replica-workload"),
            SubResourceKind::VolumeClaim => write!(f, "volume-claim"),
        }
    }
}

/// Desired configuration for one sub-resource; pure data, comparable for
/// diffing across reconciliation passes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubResourceSpec {
    pub kind: SubResourceKind,
    pub name: String,
    pub config: SubResourceConfig,
}

/// Kind-specific configuration payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubResourceConfig {
    Workload(WorkloadConfig),
    Service(ServiceConfig),
    Claim(ClaimConfig),
}

/// Configuration for a controller or replica workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Container image
    pub image: String,
    /// Engine arguments
    pub args: Vec<String>,
    /// Environment passed to the engine container
    pub env: BTreeMap<String, String>,
    /// Exposed container ports
    pub ports: Vec<PortSpec>,
    /// Node selector (placement hints from the volume spec)
    pub node_selector: BTreeMap<String, String>,
    /// Backing claim mounted at the data path, for replicas
    pub data_claim: Option<String>,
}

/// Configuration for the controller service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Exposed service ports
    pub ports: Vec<PortSpec>,
}

/// Configuration for a backing volume claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimConfig {
    /// Requested capacity in bytes
    pub capacity_bytes: u64,
    /// Storage class for the claim
    pub storage_class: Option<String>,
}

/// A named port on a workload or service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub port: u16,
}

impl PortSpec {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

// =============================================================================
// Observed State
// =============================================================================

/// Coarse health of an observed sub-resource, as derived by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadHealth {
    /// Exists but not scheduled/started (claims: unbound)
    Pending,
    /// Container running, readiness not yet signalled
    Running,
    /// Fully available (claims: bound; services: address assigned)
    Ready,
    /// Restarting repeatedly
    CrashLoop,
    /// State could not be determined
    Unknown,
}

impl std::fmt::Display for WorkloadHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadHealth::Pending => write!(f, "pending"),
            WorkloadHealth::Running => write!(f, "running"),
            WorkloadHealth::Ready => write!(f, "ready"),
            WorkloadHealth::CrashLoop => write!(f, "crashloop"),
            WorkloadHealth::Unknown => write!(f, "unknown"),
        }
    }
}

/// One sub-resource as observed in the state store: its effective config
/// (for divergence detection), health, and write-concurrency token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedSubResource {
    pub spec: SubResourceSpec,
    pub health: WorkloadHealth,
    /// Pod IP for workloads, cluster IP for the service
    pub address: Option<String>,
    /// Node the workload is scheduled on
    pub node: Option<String>,
    /// Last-observed resource version, echoed back on updates
    pub resource_version: Option<String>,
    /// Deletion already requested; skip re-delete, ignore for health
    pub terminating: bool,
}

// =============================================================================
// Replica Probe Types
// =============================================================================

/// Replica mode as reported by the jiva controller's REST API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaMode {
    /// Read-write: fully synced
    RW,
    /// Write-only: rebuilding
    WO,
    /// Faulted
    ERR,
}

impl ReplicaMode {
    /// Translate a controller-reported mode into the status sync state
    pub fn sync_state(&self) -> ReplicaSyncState {
        match self {
            ReplicaMode::RW => ReplicaSyncState::InSync,
            ReplicaMode::WO => ReplicaSyncState::Syncing,
            ReplicaMode::ERR => ReplicaSyncState::Error,
        }
    }
}

impl std::str::FromStr for ReplicaMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "RW" => Ok(ReplicaMode::RW),
            "WO" => Ok(ReplicaMode::WO),
            "ERR" => Ok(ReplicaMode::ERR),
            other => Err(format!("unknown replica mode: {}", other)),
        }
    }
}

/// One replica entry from the controller's replica listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaApiStatus {
    /// Replica data-plane address as registered with the controller
    pub address: String,
    pub mode: ReplicaMode,
}

// =============================================================================
// Event Types
// =============================================================================

/// Severity of a published notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSeverity::Normal => write!(f, "Normal"),
            EventSeverity::Warning => write!(f, "Warning"),
        }
    }
}

// =============================================================================
// Volume Store Port
// =============================================================================

/// Port for operations on the volume record itself
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Fetch a volume; None when it no longer exists
    async fn get(&self, key: &VolumeKey) -> Result<Option<JivaVolume>>;

    /// Add the operator finalizer if absent; returns the stored volume
    async fn ensure_finalizer(&self, volume: &JivaVolume) -> Result<JivaVolume>;

    /// Drop the operator finalizer, releasing the record for deletion
    async fn remove_finalizer(&self, volume: &JivaVolume) -> Result<()>;

    /// Version-checked status write; conflicts surface as transient errors
    async fn update_status(&self, volume: &JivaVolume, status: JivaVolumeStatus) -> Result<()>;
}

// =============================================================================
// Sub-Resource Store Port
// =============================================================================

/// Port for sub-resource operations, parameterized over the resource kind
#[async_trait]
pub trait SubResourceStore: Send + Sync {
    /// Fetch one sub-resource by kind and name
    async fn get(
        &self,
        kind: SubResourceKind,
        owner: &VolumeKey,
        name: &str,
    ) -> Result<Option<ObservedSubResource>>;

    /// List sub-resources of one kind carrying the owner back-reference
    async fn list_owned(
        &self,
        kind: SubResourceKind,
        owner: &VolumeKey,
    ) -> Result<Vec<ObservedSubResource>>;

    /// Create a sub-resource; creating an identical existing one is a no-op
    async fn create(&self, owner: &OwnerInfo, spec: &SubResourceSpec) -> Result<()>;

    /// Update a diverged sub-resource, echoing the last-observed version
    async fn update(
        &self,
        owner: &OwnerInfo,
        spec: &SubResourceSpec,
        resource_version: Option<String>,
    ) -> Result<()>;

    /// Delete a sub-resource; deleting an absent one is a no-op
    async fn delete(&self, kind: SubResourceKind, owner: &VolumeKey, name: &str) -> Result<()>;
}

// =============================================================================
// Replica Probe Port
// =============================================================================

/// Port for querying the jiva controller's replica listing
#[async_trait]
pub trait ReplicaProbe: Send + Sync {
    /// List replicas registered with the controller at `host`
    async fn list_replicas(&self, host: &str) -> Result<Vec<ReplicaApiStatus>>;
}

// =============================================================================
// Event Sink Port
// =============================================================================

/// Port for human-readable progress notifications. Implementations must be
/// fire-and-forget: publishing never blocks or fails reconciliation.
pub trait EventSink: Send + Sync {
    fn publish(&self, volume: &JivaVolume, severity: EventSeverity, reason: &str, message: &str);
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeStoreRef = Arc<dyn VolumeStore>;
pub type SubResourceStoreRef = Arc<dyn SubResourceStore>;
pub type ReplicaProbeRef = Arc<dyn ReplicaProbe>;
pub type EventSinkRef = Arc<dyn EventSink>;
