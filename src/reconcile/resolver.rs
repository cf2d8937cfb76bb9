//! Desired-State Resolver
//!
//! Pure derivation of the sub-resource set a JivaVolume requires: one
//! controller workload, its service, and N replica workloads each backed by
//! a claim. No I/O; resolution of the same spec is deterministic so the
//! output is directly comparable for diffing. Fails only on structurally
//! invalid specs, which is a non-retryable configuration error.

use std::collections::BTreeMap;

use crate::config::EngineConfig;
use crate::crd::JivaVolumeSpec;
use crate::domain::{
    ClaimConfig, PortSpec, ServiceConfig, SubResourceConfig, SubResourceKind, SubResourceSpec,
    VolumeKey, WorkloadConfig,
};
use crate::error::{Error, Result};

/// iSCSI portal port served by the controller
pub const ISCSI_PORT: u16 = 3260;

/// Controller REST API port (replica registration and listing)
pub const API_PORT: u16 = 9501;

/// Replica data-plane port
pub const REPLICA_PORT: u16 = 9502;

/// Replica sync port
pub const REPLICA_SYNC_PORT: u16 = 9503;

/// Mount path for replica data inside the engine container
pub const REPLICA_DATA_PATH: &str = "/openebs";

// =============================================================================
// Naming
// =============================================================================

/// Name of the controller workload for a volume
pub fn controller_name(volume: &str) -> String {
    format!("{}-jiva-ctrl", volume)
}

/// Name of the controller service for a volume
pub fn service_name(volume: &str) -> String {
    format!("{}-jiva-ctrl-svc", volume)
}

/// Name of the i-th replica workload for a volume
pub fn replica_name(volume: &str, index: u32) -> String {
    format!("{}-jiva-rep-{}", volume, index)
}

/// Name of the backing claim for the i-th replica
pub fn claim_name(volume: &str, index: u32) -> String {
    format!("{}-jiva-rep-{}-data", volume, index)
}

/// In-cluster DNS name of the controller service. Referencing the service
/// by name keeps resolution a pure function of spec; the live cluster IP
/// only ever appears in observed status.
pub fn service_fqdn(volume: &str, namespace: &str) -> String {
    format!("{}.{}.svc.cluster.local", service_name(volume), namespace)
}

// =============================================================================
// Desired State
// =============================================================================

/// The full sub-resource set one volume requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub service: SubResourceSpec,
    pub controller: SubResourceSpec,
    pub claims: Vec<SubResourceSpec>,
    pub replicas: Vec<SubResourceSpec>,
}

impl DesiredState {
    /// Descriptors of one kind, in stable index order
    pub fn of_kind(&self, kind: SubResourceKind) -> Vec<&SubResourceSpec> {
        match kind {
            SubResourceKind::ControllerService => vec![&self.service],
            SubResourceKind::ControllerWorkload => vec![&self.controller],
            SubResourceKind::VolumeClaim => self.claims.iter().collect(),
            SubResourceKind::ReplicaWorkload => self.replicas.iter().collect(),
        }
    }

    /// All descriptors in apply order: the controller's service and workload
    /// come first (replicas register against its endpoint), claims precede
    /// the replicas that mount them.
    pub fn in_apply_order(&self) -> Vec<&SubResourceSpec> {
        let mut out = vec![&self.service, &self.controller];
        out.extend(self.claims.iter());
        out.extend(self.replicas.iter());
        out
    }
}

/// Kinds in the order convergence applies them
pub const APPLY_KIND_ORDER: [SubResourceKind; 4] = [
    SubResourceKind::ControllerService,
    SubResourceKind::ControllerWorkload,
    SubResourceKind::VolumeClaim,
    SubResourceKind::ReplicaWorkload,
];

// =============================================================================
// Resolution
// =============================================================================

/// Derive the desired sub-resource set for a volume spec
pub fn resolve(key: &VolumeKey, spec: &JivaVolumeSpec, engine: &EngineConfig) -> Result<DesiredState> {
    if spec.replication_factor < 1 {
        return Err(Error::InvalidSpec {
            volume: key.name.clone(),
            reason: format!(
                "replicationFactor must be >= 1, got {}",
                spec.replication_factor
            ),
        });
    }
    let capacity_bytes = parse_capacity(&spec.capacity)?;
    if capacity_bytes == 0 {
        return Err(Error::InvalidSpec {
            volume: key.name.clone(),
            reason: "capacity must be positive".to_string(),
        });
    }

    let volume = key.name.as_str();
    let frontend = service_fqdn(volume, &key.namespace);
    let storage_class = spec
        .storage_class
        .clone()
        .or_else(|| engine.default_storage_class.clone());

    let service = SubResourceSpec {
        kind: SubResourceKind::ControllerService,
        name: service_name(volume),
        config: SubResourceConfig::Service(ServiceConfig {
            ports: vec![
                PortSpec::new("iscsi", ISCSI_PORT),
                PortSpec::new("api", API_PORT),
            ],
        }),
    };

    let mut controller_env: BTreeMap<String, String> = spec.parameters.clone();
    controller_env.insert(
        "REPLICATION_FACTOR".to_string(),
        spec.replication_factor.to_string(),
    );
    let controller = SubResourceSpec {
        kind: SubResourceKind::ControllerWorkload,
        name: controller_name(volume),
        config: SubResourceConfig::Workload(WorkloadConfig {
            image: engine.controller_image.clone(),
            args: vec![
                "launch".to_string(),
                "controller".to_string(),
                "--frontend".to_string(),
                "gotgt".to_string(),
                "--clusterIP".to_string(),
                frontend.clone(),
                volume.to_string(),
            ],
            env: controller_env,
            ports: vec![
                PortSpec::new("iscsi", ISCSI_PORT),
                PortSpec::new("api", API_PORT),
            ],
            node_selector: spec.node_selector.clone(),
            data_claim: None,
        }),
    };

    let mut claims = Vec::with_capacity(spec.replication_factor as usize);
    let mut replicas = Vec::with_capacity(spec.replication_factor as usize);
    for index in 0..spec.replication_factor {
        claims.push(SubResourceSpec {
            kind: SubResourceKind::VolumeClaim,
            name: claim_name(volume, index),
            config: SubResourceConfig::Claim(ClaimConfig {
                capacity_bytes,
                storage_class: storage_class.clone(),
            }),
        });
        replicas.push(SubResourceSpec {
            kind: SubResourceKind::ReplicaWorkload,
            name: replica_name(volume, index),
            config: SubResourceConfig::Workload(WorkloadConfig {
                image: engine.replica_image.clone(),
                args: vec![
                    "launch".to_string(),
                    "replica".to_string(),
                    "--frontendIP".to_string(),
                    frontend.clone(),
                    "--size".to_string(),
                    spec.capacity.clone(),
                    REPLICA_DATA_PATH.to_string(),
                ],
                env: spec.parameters.clone(),
                ports: vec![
                    PortSpec::new("data", REPLICA_PORT),
                    PortSpec::new("sync", REPLICA_SYNC_PORT),
                ],
                node_selector: spec.node_selector.clone(),
                data_claim: Some(claim_name(volume, index)),
            }),
        });
    }

    Ok(DesiredState {
        service,
        controller,
        claims,
        replicas,
    })
}

// =============================================================================
// Capacity Parsing
// =============================================================================

/// Parse a Kubernetes quantity string ("10Gi", "500M", "1073741824") into
/// bytes. Binary suffixes are powers of 1024, decimal suffixes powers of
/// 1000. Fractional quantities are rejected.
pub fn parse_capacity(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::CapacityParse("empty capacity".to_string()));
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(Error::CapacityParse(format!(
            "missing numeric value in {:?}",
            input
        )));
    }

    let value: u64 = digits
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid numeric value in {:?}", input)))?;

    let multiplier: u64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "K" | "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        other => {
            return Err(Error::CapacityParse(format!(
                "unknown capacity suffix {:?}",
                other
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::CapacityParse(format!("capacity overflows u64: {:?}", input)))
}
