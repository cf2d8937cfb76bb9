//! Jiva Operator
//!
//! A Kubernetes operator reconciling JivaVolume custom resources into the
//! sub-resources a jiva replicated block volume needs: one controller
//! deployment, its iSCSI/API service, and one deployment plus data claim
//! per replica.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Operator                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌─────────────────┐   ┌───────────────────┐  │
//! │  │ JivaVolume   │   │  Owned-resource │   │   Work Queue      │  │
//! │  │   watch      ├──▶│     watches     ├──▶│  (coalescing)     │  │
//! │  └──────────────┘   └─────────────────┘   └─────────┬─────────┘  │
//! │                                                     │            │
//! │                                           ┌─────────┴─────────┐  │
//! │                                           │    Worker Pool    │  │
//! │                                           │  (per-key passes) │  │
//! │                                           └─────────┬─────────┘  │
//! ├─────────────────────────────────────────────────────┼────────────┤
//! │                       Reconciler                    │            │
//! │     observe ─▶ resolve ─▶ diff ─▶ apply ─▶ status ◀─┘            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                         Adapters                                 │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌────────────────┐  │
//! │  │  Kubernetes API  │  │  Jiva controller │  │    Events      │  │
//! │  │   (KubeStore)    │  │   REST probe     │  │   recorder     │  │
//! │  └──────────────────┘  └──────────────────┘  └────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`operator`]: Assembly of watches, queue, workers, and adapters
//! - [`reconcile`]: Convergence passes, desired-state resolution, status
//! - [`scheduler`]: Coalescing work queue and worker pool
//! - [`store`]: State-store adapters (Kubernetes, in-memory, REST probe)
//! - [`crd`]: The JivaVolume custom resource definition
//! - [`domain`]: Ports and shared reconciliation types
//! - [`error`]: Error types and requeue policy

pub mod config;
pub mod crd;
pub mod domain;
pub mod error;
pub mod events;
pub mod metrics;
pub mod operator;
pub mod reconcile;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use config::{BackoffConfig, EngineConfig, OperatorConfig};

pub use crd::{
    ConditionStatus, JivaVolume, JivaVolumeSpec, JivaVolumeStatus, ReplicaStatus,
    ReplicaSyncState, VolumeCondition, VolumePhase,
};

pub use domain::ports::{
    EventSink, ObservedSubResource, ReplicaApiStatus, ReplicaMode, ReplicaProbe,
    SubResourceKind, SubResourceSpec, SubResourceStore, VolumeKey, VolumeStore,
};

pub use error::{Error, ErrorAction, Result};

pub use events::{KubeEventSink, LogEventSink, MemoryEventSink};
pub use metrics::Metrics;
pub use operator::Operator;
pub use reconcile::{Outcome, Reconciler};
pub use scheduler::{WorkQueue, WorkerPool};
pub use store::{InMemoryStore, KubeStore, TargetApiProbe};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
