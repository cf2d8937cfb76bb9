//! Kubernetes store
//!
//! Production adapter for the volume and sub-resource ports. Sub-resource
//! descriptors materialize as Deployments, Services, and claims labelled
//! and owner-referenced to the owning JivaVolume; observation maps the live
//! objects back into the neutral form the planner diffs against.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodAffinityTerm, PodAntiAffinity, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

use crate::crd::{JivaVolume, JivaVolumeStatus, JIVA_VOLUME_FINALIZER};
use crate::domain::{
    ClaimConfig, ObservedSubResource, OwnerInfo, PortSpec, ServiceConfig, SubResourceConfig,
    SubResourceKind, SubResourceSpec, VolumeKey, VolumeStore, SubResourceStore, WorkloadConfig,
    WorkloadHealth,
};
use crate::error::{Error, Result};
use crate::reconcile::{parse_capacity, resolver::REPLICA_DATA_PATH};

// =============================================================================
// Labels
// =============================================================================

pub const LABEL_CAS_TYPE: &str = "openebs.io/cas-type";
pub const LABEL_PERSISTENT_VOLUME: &str = "openebs.io/persistent-volume";
pub const LABEL_COMPONENT: &str = "openebs.io/component";

pub const CAS_TYPE_JIVA: &str = "jiva";

fn component(kind: SubResourceKind) -> &'static str {
    match kind {
        SubResourceKind::ControllerWorkload => "jiva-controller",
        SubResourceKind::ControllerService => "jiva-controller-service",
        SubResourceKind::ReplicaWorkload => "jiva-replica",
        SubResourceKind::VolumeClaim => "jiva-replica-claim",
    }
}

fn common_labels(kind: SubResourceKind, volume: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CAS_TYPE.to_string(), CAS_TYPE_JIVA.to_string()),
        (LABEL_PERSISTENT_VOLUME.to_string(), volume.to_string()),
        (LABEL_COMPONENT.to_string(), component(kind).to_string()),
    ])
}

fn pod_labels(kind: SubResourceKind, volume: &str, workload: &str) -> BTreeMap<String, String> {
    let mut labels = common_labels(kind, volume);
    labels.insert("app".to_string(), workload.to_string());
    labels
}

fn owner_reference(owner: &OwnerInfo) -> OwnerReference {
    OwnerReference {
        api_version: "openebs.io/v1alpha1".to_string(),
        kind: "JivaVolume".to_string(),
        name: owner.key.name.clone(),
        uid: owner.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

// =============================================================================
// Kube Store
// =============================================================================

/// Store adapter backed by the cluster API
pub struct KubeStore {
    client: Client,
    api_timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, api_timeout: Duration) -> Self {
        Self { client, api_timeout }
    }

    fn volumes(&self, namespace: &str) -> Api<JivaVolume> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Bound one store operation by the configured API deadline
    async fn with_deadline<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        match tokio::time::timeout(self.api_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout { operation }),
        }
    }

    async fn pods_for_workload(&self, namespace: &str, workload: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&format!("app={}", workload));
        Ok(self.pods(namespace).list(&params).await?.items)
    }

    async fn observe_deployment(
        &self,
        kind: SubResourceKind,
        owner: &VolumeKey,
        deployment: Deployment,
    ) -> Result<ObservedSubResource> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let pods = self.pods_for_workload(&owner.namespace, &name).await?;
        Ok(observed_deployment(kind, &deployment, &pods))
    }

    async fn get_deployment(
        &self,
        kind: SubResourceKind,
        owner: &VolumeKey,
        name: &str,
    ) -> Result<Option<ObservedSubResource>> {
        let deployment = match self.deployments(&owner.namespace).get_opt(name).await? {
            Some(d) if is_owned(&d.metadata, owner) => d,
            _ => return Ok(None),
        };
        Ok(Some(self.observe_deployment(kind, owner, deployment).await?))
    }
}

fn is_owned(metadata: &ObjectMeta, owner: &VolumeKey) -> bool {
    metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_PERSISTENT_VOLUME))
        .map(|v| v == &owner.name)
        .unwrap_or(false)
}

fn owned_list_params(kind: SubResourceKind, owner: &VolumeKey) -> ListParams {
    ListParams::default().labels(&format!(
        "{}={},{}={}",
        LABEL_COMPONENT,
        component(kind),
        LABEL_PERSISTENT_VOLUME,
        owner.name
    ))
}

// =============================================================================
// Materialization
// =============================================================================

fn build_deployment(owner: &OwnerInfo, spec: &SubResourceSpec, cfg: &WorkloadConfig) -> Deployment {
    let labels = pod_labels(spec.kind, &owner.key.name, &spec.name);

    let env = cfg
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let ports = cfg
        .ports
        .iter()
        .map(|p| ContainerPort {
            name: Some(p.name.clone()),
            container_port: i32::from(p.port),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let mut container = Container {
        name: component(spec.kind).to_string(),
        image: Some(cfg.image.clone()),
        args: Some(cfg.args.clone()),
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then_some(ports),
        ..Default::default()
    };

    let mut volumes = None;
    if let Some(claim) = &cfg.data_claim {
        container.volume_mounts = Some(vec![VolumeMount {
            name: "data".to_string(),
            mount_path: REPLICA_DATA_PATH.to_string(),
            ..Default::default()
        }]);
        volumes = Some(vec![Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.clone(),
                read_only: Some(false),
            }),
            ..Default::default()
        }]);
    }

    // Replicas prefer spreading across nodes so one node failure costs at
    // most one data copy.
    let affinity = (spec.kind == SubResourceKind::ReplicaWorkload).then(|| Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(common_labels(spec.kind, &owner.key.name)),
                            ..Default::default()
                        }),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    });

    Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(owner.key.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(owner)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            // Data-attached single-writer pods must never surge
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes,
                    node_selector: (!cfg.node_selector.is_empty())
                        .then(|| cfg.node_selector.clone()),
                    affinity,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(owner: &OwnerInfo, spec: &SubResourceSpec, cfg: &ServiceConfig) -> Service {
    let ports = cfg
        .ports
        .iter()
        .map(|p| ServicePort {
            name: Some(p.name.clone()),
            port: i32::from(p.port),
            target_port: Some(IntOrString::Int(i32::from(p.port))),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    Service {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(owner.key.namespace.clone()),
            labels: Some(common_labels(spec.kind, &owner.key.name)),
            owner_references: Some(vec![owner_reference(owner)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(BTreeMap::from([
                (
                    LABEL_COMPONENT.to_string(),
                    component(SubResourceKind::ControllerWorkload).to_string(),
                ),
                (
                    LABEL_PERSISTENT_VOLUME.to_string(),
                    owner.key.name.clone(),
                ),
            ])),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_claim(
    owner: &OwnerInfo,
    spec: &SubResourceSpec,
    cfg: &ClaimConfig,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(owner.key.namespace.clone()),
            labels: Some(common_labels(spec.kind, &owner.key.name)),
            owner_references: Some(vec![owner_reference(owner)]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: cfg.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(cfg.capacity_bytes.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Observation
// =============================================================================

fn workload_config_from(deployment: &Deployment) -> WorkloadConfig {
    let pod_spec = deployment
        .spec
        .as_ref()
        .map(|s| &s.template)
        .and_then(|t| t.spec.as_ref());
    let container = pod_spec.and_then(|s| s.containers.first());

    let env = container
        .and_then(|c| c.env.as_ref())
        .map(|env| {
            env.iter()
                .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();

    let ports = container
        .and_then(|c| c.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| PortSpec {
                    name: p.name.clone().unwrap_or_default(),
                    port: u16::try_from(p.container_port).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    let data_claim = pod_spec
        .and_then(|s| s.volumes.as_ref())
        .and_then(|volumes| {
            volumes
                .iter()
                .find_map(|v| v.persistent_volume_claim.as_ref())
        })
        .map(|pvc| pvc.claim_name.clone());

    WorkloadConfig {
        image: container
            .and_then(|c| c.image.clone())
            .unwrap_or_default(),
        args: container.and_then(|c| c.args.clone()).unwrap_or_default(),
        env,
        ports,
        node_selector: pod_spec
            .and_then(|s| s.node_selector.clone())
            .unwrap_or_default(),
        data_claim,
    }
}

fn service_config_from(service: &Service) -> ServiceConfig {
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| PortSpec {
                    name: p.name.clone().unwrap_or_default(),
                    port: u16::try_from(p.port).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();
    ServiceConfig { ports }
}

fn claim_config_from(claim: &PersistentVolumeClaim) -> ClaimConfig {
    let capacity_bytes = claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .and_then(|q| parse_capacity(&q.0).ok())
        .unwrap_or_default();
    ClaimConfig {
        capacity_bytes,
        storage_class: claim
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.clone()),
    }
}

fn derive_workload_health(deployment: &Deployment, pods: &[Pod]) -> WorkloadHealth {
    if let Some(status) = &deployment.status {
        if status.available_replicas.unwrap_or(0) >= 1 {
            return WorkloadHealth::Ready;
        }
    }
    let mut saw_running = false;
    for pod in pods {
        let Some(status) = &pod.status else { continue };
        for cs in status.container_statuses.iter().flatten() {
            let waiting = cs.state.as_ref().and_then(|s| s.waiting.as_ref());
            if waiting.and_then(|w| w.reason.as_deref()) == Some("CrashLoopBackOff") {
                return WorkloadHealth::CrashLoop;
            }
        }
        if status.phase.as_deref() == Some("Running") {
            saw_running = true;
        }
    }
    if saw_running {
        WorkloadHealth::Running
    } else {
        WorkloadHealth::Pending
    }
}

fn observed_deployment(
    kind: SubResourceKind,
    deployment: &Deployment,
    pods: &[Pod],
) -> ObservedSubResource {
    let running = pods
        .iter()
        .find(|p| p.status.as_ref().and_then(|s| s.pod_ip.as_ref()).is_some());
    ObservedSubResource {
        spec: SubResourceSpec {
            kind,
            name: deployment.metadata.name.clone().unwrap_or_default(),
            config: SubResourceConfig::Workload(workload_config_from(deployment)),
        },
        health: derive_workload_health(deployment, pods),
        address: running.and_then(|p| p.status.as_ref()).and_then(|s| s.pod_ip.clone()),
        node: running
            .and_then(|p| p.spec.as_ref())
            .and_then(|s| s.node_name.clone()),
        resource_version: deployment.metadata.resource_version.clone(),
        terminating: deployment.metadata.deletion_timestamp.is_some(),
    }
}

fn observed_service(service: &Service) -> ObservedSubResource {
    let cluster_ip = service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.clone())
        .filter(|ip| !ip.is_empty() && ip != "None");
    ObservedSubResource {
        spec: SubResourceSpec {
            kind: SubResourceKind::ControllerService,
            name: service.metadata.name.clone().unwrap_or_default(),
            config: SubResourceConfig::Service(service_config_from(service)),
        },
        health: if cluster_ip.is_some() {
            WorkloadHealth::Ready
        } else {
            WorkloadHealth::Pending
        },
        address: cluster_ip,
        node: None,
        resource_version: service.metadata.resource_version.clone(),
        terminating: service.metadata.deletion_timestamp.is_some(),
    }
}

fn observed_claim(claim: &PersistentVolumeClaim) -> ObservedSubResource {
    let health = match claim.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Bound") => WorkloadHealth::Ready,
        Some("Pending") | None => WorkloadHealth::Pending,
        Some(_) => WorkloadHealth::Unknown,
    };
    ObservedSubResource {
        spec: SubResourceSpec {
            kind: SubResourceKind::VolumeClaim,
            name: claim.metadata.name.clone().unwrap_or_default(),
            config: SubResourceConfig::Claim(claim_config_from(claim)),
        },
        health,
        address: None,
        node: None,
        resource_version: claim.metadata.resource_version.clone(),
        terminating: claim.metadata.deletion_timestamp.is_some(),
    }
}

// =============================================================================
// Volume Store
// =============================================================================

#[async_trait]
impl VolumeStore for KubeStore {
    async fn get(&self, key: &VolumeKey) -> Result<Option<JivaVolume>> {
        let api = self.volumes(&key.namespace);
        self.with_deadline("volume get", async move { Ok(api.get_opt(&key.name).await?) })
            .await
    }

    async fn ensure_finalizer(&self, volume: &JivaVolume) -> Result<JivaVolume> {
        if volume.has_finalizer() {
            return Ok(volume.clone());
        }
        let key = VolumeKey::for_volume(volume)
            .ok_or_else(|| Error::Internal("volume missing namespace or name".to_string()))?;
        let mut finalizers = volume.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(JIVA_VOLUME_FINALIZER.to_string());
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        let api = self.volumes(&key.namespace);
        self.with_deadline("finalizer add", async move {
            Ok(api
                .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?)
        })
        .await
    }

    async fn remove_finalizer(&self, volume: &JivaVolume) -> Result<()> {
        let key = VolumeKey::for_volume(volume)
            .ok_or_else(|| Error::Internal("volume missing namespace or name".to_string()))?;
        let finalizers: Vec<String> = volume
            .metadata
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != JIVA_VOLUME_FINALIZER)
            .collect();
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        let api = self.volumes(&key.namespace);
        self.with_deadline("finalizer remove", async move {
            match api
                .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update_status(&self, volume: &JivaVolume, status: JivaVolumeStatus) -> Result<()> {
        let key = VolumeKey::for_volume(volume)
            .ok_or_else(|| Error::Internal("volume missing namespace or name".to_string()))?;
        let mut updated = volume.clone();
        updated.status = Some(status);
        // The carried resourceVersion makes this write version-checked: a
        // concurrent volume change surfaces as a 409 and the pass retries
        // against fresh state.
        let payload = serde_json::to_vec(&updated)?;
        let api = self.volumes(&key.namespace);
        self.with_deadline("status update", async move {
            api.replace_status(&key.name, &PostParams::default(), payload)
                .await?;
            Ok(())
        })
        .await
    }
}

// =============================================================================
// Sub-Resource Store
// =============================================================================

#[async_trait]
impl SubResourceStore for KubeStore {
    async fn get(
        &self,
        kind: SubResourceKind,
        owner: &VolumeKey,
        name: &str,
    ) -> Result<Option<ObservedSubResource>> {
        self.with_deadline("sub-resource get", async move {
            match kind {
                SubResourceKind::ControllerWorkload | SubResourceKind::ReplicaWorkload => {
                    self.get_deployment(kind, owner, name).await
                }
                SubResourceKind::ControllerService => {
                    let service = self.services(&owner.namespace).get_opt(name).await?;
                    Ok(service
                        .filter(|s| is_owned(&s.metadata, owner))
                        .map(|s| observed_service(&s)))
                }
                SubResourceKind::VolumeClaim => {
                    let claim = self.claims(&owner.namespace).get_opt(name).await?;
                    Ok(claim
                        .filter(|c| is_owned(&c.metadata, owner))
                        .map(|c| observed_claim(&c)))
                }
            }
        })
        .await
    }

    async fn list_owned(
        &self,
        kind: SubResourceKind,
        owner: &VolumeKey,
    ) -> Result<Vec<ObservedSubResource>> {
        let params = owned_list_params(kind, owner);
        self.with_deadline("sub-resource list", async move {
            match kind {
                SubResourceKind::ControllerWorkload | SubResourceKind::ReplicaWorkload => {
                    let list = self.deployments(&owner.namespace).list(&params).await?;
                    let mut observed = Vec::with_capacity(list.items.len());
                    for deployment in list.items {
                        observed.push(self.observe_deployment(kind, owner, deployment).await?);
                    }
                    Ok(observed)
                }
                SubResourceKind::ControllerService => {
                    let list = self.services(&owner.namespace).list(&params).await?;
                    Ok(list.items.iter().map(observed_service).collect())
                }
                SubResourceKind::VolumeClaim => {
                    let list = self.claims(&owner.namespace).list(&params).await?;
                    Ok(list.items.iter().map(observed_claim).collect())
                }
            }
        })
        .await
    }

    async fn create(&self, owner: &OwnerInfo, spec: &SubResourceSpec) -> Result<()> {
        let namespace = owner.key.namespace.clone();
        debug!(kind = %spec.kind, name = %spec.name, "creating sub-resource");
        self.with_deadline("sub-resource create", async move {
            let result = match &spec.config {
                SubResourceConfig::Workload(cfg) => {
                    let deployment = build_deployment(owner, spec, cfg);
                    self.deployments(&namespace)
                        .create(&PostParams::default(), &deployment)
                        .await
                        .map(|_| ())
                }
                SubResourceConfig::Service(cfg) => {
                    let service = build_service(owner, spec, cfg);
                    self.services(&namespace)
                        .create(&PostParams::default(), &service)
                        .await
                        .map(|_| ())
                }
                SubResourceConfig::Claim(cfg) => {
                    let claim = build_claim(owner, spec, cfg);
                    self.claims(&namespace)
                        .create(&PostParams::default(), &claim)
                        .await
                        .map(|_| ())
                }
            };
            match result {
                Ok(()) => Ok(()),
                Err(kube::Error::Api(e)) if e.reason == "AlreadyExists" => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update(
        &self,
        owner: &OwnerInfo,
        spec: &SubResourceSpec,
        resource_version: Option<String>,
    ) -> Result<()> {
        let namespace = owner.key.namespace.clone();
        debug!(kind = %spec.kind, name = %spec.name, "updating sub-resource");
        self.with_deadline("sub-resource update", async move {
            match &spec.config {
                SubResourceConfig::Workload(cfg) => {
                    let mut deployment = build_deployment(owner, spec, cfg);
                    deployment.metadata.resource_version = resource_version;
                    self.deployments(&namespace)
                        .replace(&spec.name, &PostParams::default(), &deployment)
                        .await?;
                }
                SubResourceConfig::Service(cfg) => {
                    // ClusterIP is immutable and server-assigned; carry it over
                    let api = self.services(&namespace);
                    let current = api.get(&spec.name).await?;
                    let mut service = build_service(owner, spec, cfg);
                    service.metadata.resource_version = resource_version;
                    if let (Some(desired), Some(live)) =
                        (service.spec.as_mut(), current.spec.as_ref())
                    {
                        desired.cluster_ip = live.cluster_ip.clone();
                        desired.cluster_ips = live.cluster_ips.clone();
                    }
                    api.replace(&spec.name, &PostParams::default(), &service)
                        .await?;
                }
                SubResourceConfig::Claim(cfg) => {
                    // Only resources.requests may change on a bound claim
                    let api = self.claims(&namespace);
                    let mut claim = api.get(&spec.name).await?;
                    if let Some(resources) = claim
                        .spec
                        .as_mut()
                        .and_then(|s| s.resources.as_mut())
                    {
                        resources.requests = Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(cfg.capacity_bytes.to_string()),
                        )]));
                    }
                    claim.metadata.resource_version = resource_version;
                    api.replace(&spec.name, &PostParams::default(), &claim)
                        .await?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, kind: SubResourceKind, owner: &VolumeKey, name: &str) -> Result<()> {
        let namespace = owner.namespace.clone();
        debug!(%kind, name, "deleting sub-resource");
        self.with_deadline("sub-resource delete", async move {
            let result = match kind {
                SubResourceKind::ControllerWorkload | SubResourceKind::ReplicaWorkload => self
                    .deployments(&namespace)
                    .delete(name, &DeleteParams::default())
                    .await
                    .map(|_| ()),
                SubResourceKind::ControllerService => self
                    .services(&namespace)
                    .delete(name, &DeleteParams::default())
                    .await
                    .map(|_| ()),
                SubResourceKind::VolumeClaim => self
                    .claims(&namespace)
                    .delete(name, &DeleteParams::default())
                    .await
                    .map(|_| ()),
            };
            match result {
                Ok(()) => Ok(()),
                Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus,
    };

    fn owner() -> OwnerInfo {
        OwnerInfo {
            key: VolumeKey::new("openebs", "pvc-1"),
            uid: "uid-pvc-1".to_string(),
        }
    }

    fn replica_cfg() -> WorkloadConfig {
        WorkloadConfig {
            image: "openebs/jiva:3.6.2".to_string(),
            args: vec!["launch".to_string(), "replica".to_string()],
            env: BTreeMap::from([("REPLICATION_FACTOR".to_string(), "3".to_string())]),
            ports: vec![PortSpec::new("replica", 9502), PortSpec::new("sync", 9503)],
            node_selector: BTreeMap::new(),
            data_claim: Some("pvc-1-jiva-rep-0-data".to_string()),
        }
    }

    fn replica_spec() -> SubResourceSpec {
        SubResourceSpec {
            kind: SubResourceKind::ReplicaWorkload,
            name: "pvc-1-jiva-rep-0".to_string(),
            config: SubResourceConfig::Workload(replica_cfg()),
        }
    }

    #[test]
    fn test_deployment_carries_owner_and_labels() {
        let deployment = build_deployment(&owner(), &replica_spec(), &replica_cfg());

        let refs = deployment.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "JivaVolume");
        assert_eq!(refs[0].uid, "uid-pvc-1");
        assert_eq!(refs[0].controller, Some(true));

        let labels = deployment.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_CAS_TYPE), Some(&"jiva".to_string()));
        assert_eq!(
            labels.get(LABEL_PERSISTENT_VOLUME),
            Some(&"pvc-1".to_string())
        );

        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.strategy.as_ref().unwrap().type_.as_deref(),
            Some("Recreate")
        );
    }

    #[test]
    fn test_replica_deployment_mounts_data_claim() {
        let deployment = build_deployment(&owner(), &replica_spec(), &replica_cfg());
        let pod_spec = deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap();

        let volumes = pod_spec.volumes.as_ref().unwrap();
        assert_eq!(
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "pvc-1-jiva-rep-0-data"
        );
        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, REPLICA_DATA_PATH);

        // Replicas spread across nodes
        assert!(pod_spec.affinity.as_ref().unwrap().pod_anti_affinity.is_some());
    }

    #[test]
    fn test_controller_deployment_has_no_anti_affinity() {
        let cfg = WorkloadConfig {
            data_claim: None,
            ..replica_cfg()
        };
        let spec = SubResourceSpec {
            kind: SubResourceKind::ControllerWorkload,
            name: "pvc-1-jiva-ctrl".to_string(),
            config: SubResourceConfig::Workload(cfg.clone()),
        };
        let deployment = build_deployment(&owner(), &spec, &cfg);
        let pod_spec = deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap();
        assert!(pod_spec.affinity.is_none());
        assert!(pod_spec.volumes.is_none());
    }

    #[test]
    fn test_service_selects_controller_pods() {
        let cfg = ServiceConfig {
            ports: vec![PortSpec::new("iscsi", 3260), PortSpec::new("api", 9501)],
        };
        let spec = SubResourceSpec {
            kind: SubResourceKind::ControllerService,
            name: "pvc-1-jiva-ctrl-svc".to_string(),
            config: SubResourceConfig::Service(cfg.clone()),
        };
        let service = build_service(&owner(), &spec, &cfg);

        let svc_spec = service.spec.as_ref().unwrap();
        assert_eq!(svc_spec.type_.as_deref(), Some("ClusterIP"));
        let selector = svc_spec.selector.as_ref().unwrap();
        assert_eq!(
            selector.get(LABEL_COMPONENT),
            Some(&"jiva-controller".to_string())
        );
        assert_eq!(selector.get(LABEL_PERSISTENT_VOLUME), Some(&"pvc-1".to_string()));

        let ports = svc_spec.ports.as_ref().unwrap();
        assert_eq!(ports[0].port, 3260);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(3260)));
    }

    #[test]
    fn test_claim_requests_exact_bytes() {
        let cfg = ClaimConfig {
            capacity_bytes: 5 * 1024 * 1024 * 1024,
            storage_class: Some("openebs-hostpath".to_string()),
        };
        let spec = SubResourceSpec {
            kind: SubResourceKind::VolumeClaim,
            name: "pvc-1-jiva-rep-0-data".to_string(),
            config: SubResourceConfig::Claim(cfg.clone()),
        };
        let claim = build_claim(&owner(), &spec, &cfg);

        let claim_spec = claim.spec.as_ref().unwrap();
        assert_eq!(
            claim_spec.access_modes,
            Some(vec!["ReadWriteOnce".to_string()])
        );
        assert_eq!(
            claim_spec.storage_class_name.as_deref(),
            Some("openebs-hostpath")
        );
        let requests = claim_spec
            .resources
            .as_ref()
            .unwrap()
            .requests
            .as_ref()
            .unwrap();
        assert_eq!(requests.get("storage").unwrap().0, "5368709120");
    }

    #[test]
    fn test_workload_config_round_trips_through_deployment() {
        let cfg = replica_cfg();
        let deployment = build_deployment(&owner(), &replica_spec(), &cfg);
        assert_eq!(workload_config_from(&deployment), cfg);
    }

    #[test]
    fn test_claim_config_round_trips_through_claim() {
        let cfg = ClaimConfig {
            capacity_bytes: 1073741824,
            storage_class: None,
        };
        let spec = SubResourceSpec {
            kind: SubResourceKind::VolumeClaim,
            name: "pvc-1-jiva-rep-1-data".to_string(),
            config: SubResourceConfig::Claim(cfg.clone()),
        };
        let claim = build_claim(&owner(), &spec, &cfg);
        assert_eq!(claim_config_from(&claim), cfg);
    }

    fn pod_with(phase: &str, waiting_reason: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: waiting_reason.map(|reason| {
                    vec![ContainerStatus {
                        state: Some(ContainerState {
                            waiting: Some(ContainerStateWaiting {
                                reason: Some(reason.to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_workload_health_derivation() {
        let available = Deployment {
            status: Some(DeploymentStatus {
                available_replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            derive_workload_health(&available, &[]),
            WorkloadHealth::Ready
        );

        let empty = Deployment::default();
        assert_eq!(derive_workload_health(&empty, &[]), WorkloadHealth::Pending);
        assert_eq!(
            derive_workload_health(&empty, &[pod_with("Running", None)]),
            WorkloadHealth::Running
        );
        assert_eq!(
            derive_workload_health(&empty, &[pod_with("Pending", None)]),
            WorkloadHealth::Pending
        );
        assert_eq!(
            derive_workload_health(&empty, &[pod_with("Running", Some("CrashLoopBackOff"))]),
            WorkloadHealth::CrashLoop
        );
    }

    #[test]
    fn test_service_observation_requires_cluster_ip() {
        let mut service = build_service(
            &owner(),
            &SubResourceSpec {
                kind: SubResourceKind::ControllerService,
                name: "pvc-1-jiva-ctrl-svc".to_string(),
                config: SubResourceConfig::Service(ServiceConfig {
                    ports: vec![PortSpec::new("iscsi", 3260)],
                }),
            },
            &ServiceConfig {
                ports: vec![PortSpec::new("iscsi", 3260)],
            },
        );
        let observed = observed_service(&service);
        assert_eq!(observed.health, WorkloadHealth::Pending);
        assert!(observed.address.is_none());

        if let Some(spec) = service.spec.as_mut() {
            spec.cluster_ip = Some("10.96.0.17".to_string());
        }
        let observed = observed_service(&service);
        assert_eq!(observed.health, WorkloadHealth::Ready);
        assert_eq!(observed.address.as_deref(), Some("10.96.0.17"));
    }
}
