//! In-memory store
//!
//! Deterministic doubles for the volume store, sub-resource store, and
//! replica probe. Tests drive cluster state through the setters here and
//! assert on the recorded operation trace instead of a live API server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::crd::{JivaVolume, JivaVolumeStatus, VolumePhase, JIVA_VOLUME_FINALIZER};
use crate::domain::{
    ObservedSubResource, OwnerInfo, ReplicaApiStatus, ReplicaMode, ReplicaProbe, SubResourceKind,
    SubResourceSpec, SubResourceStore, VolumeKey, VolumeStore, WorkloadHealth,
};
use crate::error::{Error, Result};

// =============================================================================
// Operation Trace
// =============================================================================

/// One mutation recorded by the in-memory store, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Create { kind: SubResourceKind, name: String },
    Update { kind: SubResourceKind, name: String },
    Delete { kind: SubResourceKind, name: String },
    StatusWrite { phase: VolumePhase },
    FinalizerAdded,
    FinalizerRemoved,
}

// =============================================================================
// In-Memory Store
// =============================================================================

#[derive(Debug)]
struct StoredSub {
    owner: VolumeKey,
    spec: SubResourceSpec,
    health: WorkloadHealth,
    address: Option<String>,
    node: Option<String>,
    resource_version: u64,
    terminating: bool,
    /// Delete marks the entry terminating instead of removing it
    sticky: bool,
}

/// Volume and sub-resource store backed by plain maps
#[derive(Debug, Default)]
pub struct InMemoryStore {
    volumes: Mutex<BTreeMap<VolumeKey, JivaVolume>>,
    subs: Mutex<BTreeMap<(SubResourceKind, String), StoredSub>>,
    trace: Mutex<Vec<StoreOp>>,
    next_version: AtomicU64,
    next_service_ip: AtomicU64,
    fail_next_create: AtomicBool,
    fail_next_status: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a volume, filling in namespace and uid when the test left them
    /// unset. Returns the key the store filed it under.
    pub fn put_volume(&self, mut volume: JivaVolume) -> VolumeKey {
        if volume.metadata.namespace.is_none() {
            volume.metadata.namespace = Some("openebs".to_string());
        }
        if volume.metadata.uid.is_none() {
            let name = volume.metadata.name.as_deref().unwrap_or("volume");
            volume.metadata.uid = Some(format!("uid-{}", name));
        }
        let key = VolumeKey::for_volume(&volume)
            .unwrap_or_else(|| VolumeKey::new("openebs", "unnamed"));
        self.volumes.lock().insert(key.clone(), volume);
        key
    }

    /// Current stored copy of a volume
    pub fn volume(&self, key: &VolumeKey) -> Option<JivaVolume> {
        self.volumes.lock().get(key).cloned()
    }

    /// Stamp a deletion timestamp, as the API server does on delete
    pub fn mark_deleted(&self, key: &VolumeKey) {
        if let Some(volume) = self.volumes.lock().get_mut(key) {
            volume.metadata.deletion_timestamp =
                Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                    chrono::Utc::now(),
                ));
        }
    }

    pub fn set_health(&self, kind: SubResourceKind, name: &str, health: WorkloadHealth) {
        if let Some(sub) = self.subs.lock().get_mut(&(kind, name.to_string())) {
            sub.health = health;
        }
    }

    pub fn set_address(&self, kind: SubResourceKind, name: &str, address: &str) {
        if let Some(sub) = self.subs.lock().get_mut(&(kind, name.to_string())) {
            sub.address = Some(address.to_string());
        }
    }

    pub fn set_node(&self, kind: SubResourceKind, name: &str, node: &str) {
        if let Some(sub) = self.subs.lock().get_mut(&(kind, name.to_string())) {
            sub.node = Some(node.to_string());
        }
    }

    /// Mark every stored sub-resource fully available
    pub fn make_all_ready(&self) {
        for sub in self.subs.lock().values_mut() {
            sub.health = WorkloadHealth::Ready;
        }
    }

    /// Make future deletes of this entry leave it in the terminating state
    pub fn sticky_delete(&self, kind: SubResourceKind, name: &str) {
        if let Some(sub) = self.subs.lock().get_mut(&(kind, name.to_string())) {
            sub.sticky = true;
        }
    }

    /// Clear the terminating entry, as when the API server finishes a delete
    pub fn finish_delete(&self, kind: SubResourceKind, name: &str) {
        self.subs.lock().remove(&(kind, name.to_string()));
    }

    /// Names of stored sub-resources of one kind, terminating ones included
    pub fn sub_names(&self, kind: SubResourceKind) -> Vec<String> {
        self.subs
            .lock()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn contains(&self, kind: SubResourceKind, name: &str) -> bool {
        self.subs.lock().contains_key(&(kind, name.to_string()))
    }

    /// Drain the recorded operation trace
    pub fn take_trace(&self) -> Vec<StoreOp> {
        std::mem::take(&mut *self.trace.lock())
    }

    /// Fail the next sub-resource create with a transient error
    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    /// Fail the next status write with a transient error
    pub fn fail_next_status_write(&self) {
        self.fail_next_status.store(true, Ordering::SeqCst);
    }

    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, op: StoreOp) {
        self.trace.lock().push(op);
    }
}

fn observed(stored: &StoredSub) -> ObservedSubResource {
    ObservedSubResource {
        spec: stored.spec.clone(),
        health: stored.health,
        address: stored.address.clone(),
        node: stored.node.clone(),
        resource_version: Some(stored.resource_version.to_string()),
        terminating: stored.terminating,
    }
}

fn conflict_error(name: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!(
            "Operation cannot be fulfilled on {}: the object has been modified",
            name
        ),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

#[async_trait]
impl VolumeStore for InMemoryStore {
    async fn get(&self, key: &VolumeKey) -> Result<Option<JivaVolume>> {
        Ok(self.volumes.lock().get(key).cloned())
    }

    async fn ensure_finalizer(&self, volume: &JivaVolume) -> Result<JivaVolume> {
        let key = VolumeKey::for_volume(volume)
            .ok_or_else(|| Error::Internal("volume missing namespace or name".to_string()))?;
        let mut volumes = self.volumes.lock();
        let stored = volumes
            .get_mut(&key)
            .ok_or_else(|| Error::Internal(format!("volume {} not found", key)))?;
        if !stored.has_finalizer() {
            stored
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(JIVA_VOLUME_FINALIZER.to_string());
            self.record(StoreOp::FinalizerAdded);
        }
        Ok(stored.clone())
    }

    async fn remove_finalizer(&self, volume: &JivaVolume) -> Result<()> {
        let key = VolumeKey::for_volume(volume)
            .ok_or_else(|| Error::Internal("volume missing namespace or name".to_string()))?;
        let mut volumes = self.volumes.lock();
        if let Some(stored) = volumes.get_mut(&key) {
            if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != JIVA_VOLUME_FINALIZER);
            }
            self.record(StoreOp::FinalizerRemoved);
            let released = stored
                .metadata
                .finalizers
                .as_ref()
                .map(|f| f.is_empty())
                .unwrap_or(true);
            if stored.deletion_requested() && released {
                volumes.remove(&key);
            }
        }
        Ok(())
    }

    async fn update_status(&self, volume: &JivaVolume, status: JivaVolumeStatus) -> Result<()> {
        if self.fail_next_status.swap(false, Ordering::SeqCst) {
            return Err(Error::Timeout {
                operation: "status update",
            });
        }
        let key = VolumeKey::for_volume(volume)
            .ok_or_else(|| Error::Internal("volume missing namespace or name".to_string()))?;
        let mut volumes = self.volumes.lock();
        let stored = volumes
            .get_mut(&key)
            .ok_or_else(|| Error::Internal(format!("volume {} not found", key)))?;
        self.record(StoreOp::StatusWrite {
            phase: status.phase,
        });
        stored.status = Some(status);
        Ok(())
    }
}

#[async_trait]
impl SubResourceStore for InMemoryStore {
    async fn get(
        &self,
        kind: SubResourceKind,
        owner: &VolumeKey,
        name: &str,
    ) -> Result<Option<ObservedSubResource>> {
        Ok(self
            .subs
            .lock()
            .get(&(kind, name.to_string()))
            .filter(|s| s.owner == *owner)
            .map(observed))
    }

    async fn list_owned(
        &self,
        kind: SubResourceKind,
        owner: &VolumeKey,
    ) -> Result<Vec<ObservedSubResource>> {
        Ok(self
            .subs
            .lock()
            .iter()
            .filter(|((k, _), s)| *k == kind && s.owner == *owner)
            .map(|(_, s)| observed(s))
            .collect())
    }

    async fn create(&self, owner: &OwnerInfo, spec: &SubResourceSpec) -> Result<()> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(Error::Timeout {
                operation: "sub-resource create",
            });
        }
        let mut subs = self.subs.lock();
        let map_key = (spec.kind, spec.name.clone());
        if subs.contains_key(&map_key) {
            return Ok(());
        }
        // Fresh workloads start unscheduled; services and claims bind at
        // once. Replica addresses mirror the name so scripted probe entries
        // can reference them.
        let (health, address) = match spec.kind {
            SubResourceKind::ControllerWorkload => (WorkloadHealth::Pending, None),
            SubResourceKind::ReplicaWorkload => {
                (WorkloadHealth::Pending, Some(spec.name.clone()))
            }
            SubResourceKind::ControllerService => {
                let octet = 10 + self.next_service_ip.fetch_add(1, Ordering::SeqCst);
                (WorkloadHealth::Ready, Some(format!("10.96.0.{}", octet)))
            }
            SubResourceKind::VolumeClaim => (WorkloadHealth::Ready, None),
        };
        subs.insert(
            map_key,
            StoredSub {
                owner: owner.key.clone(),
                spec: spec.clone(),
                health,
                address,
                node: None,
                resource_version: self.bump_version(),
                terminating: false,
                sticky: false,
            },
        );
        self.record(StoreOp::Create {
            kind: spec.kind,
            name: spec.name.clone(),
        });
        Ok(())
    }

    async fn update(
        &self,
        _owner: &OwnerInfo,
        spec: &SubResourceSpec,
        resource_version: Option<String>,
    ) -> Result<()> {
        let mut subs = self.subs.lock();
        let stored = subs
            .get_mut(&(spec.kind, spec.name.clone()))
            .ok_or_else(|| {
                Error::Internal(format!("update of absent {} {}", spec.kind, spec.name))
            })?;
        let expected = resource_version.unwrap_or_default();
        if expected != stored.resource_version.to_string() {
            return Err(conflict_error(&spec.name));
        }
        stored.spec = spec.clone();
        stored.resource_version = self.bump_version();
        self.record(StoreOp::Update {
            kind: spec.kind,
            name: spec.name.clone(),
        });
        Ok(())
    }

    async fn delete(&self, kind: SubResourceKind, _owner: &VolumeKey, name: &str) -> Result<()> {
        let mut subs = self.subs.lock();
        let map_key = (kind, name.to_string());
        match subs.get_mut(&map_key) {
            None => Ok(()),
            Some(stored) if stored.sticky => {
                stored.terminating = true;
                self.record(StoreOp::Delete {
                    kind,
                    name: name.to_string(),
                });
                Ok(())
            }
            Some(_) => {
                subs.remove(&map_key);
                self.record(StoreOp::Delete {
                    kind,
                    name: name.to_string(),
                });
                Ok(())
            }
        }
    }
}

// =============================================================================
// Scripted Probe
// =============================================================================

/// Replica probe returning a scripted listing
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    replicas: Mutex<Vec<ReplicaApiStatus>>,
    unavailable: AtomicBool,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the listing the controller will report
    pub fn set_replicas(&self, entries: Vec<(String, ReplicaMode)>) {
        *self.replicas.lock() = entries
            .into_iter()
            .map(|(address, mode)| ReplicaApiStatus { address, mode })
            .collect();
    }

    /// Make the probe fail, as when the controller API is unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReplicaProbe for ScriptedProbe {
    async fn list_replicas(&self, _host: &str) -> Result<Vec<ReplicaApiStatus>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Timeout {
                operation: "replica listing",
            });
        }
        Ok(self.replicas.lock().clone())
    }
}
