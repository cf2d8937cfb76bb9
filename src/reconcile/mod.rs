//! Reconciliation engine
//!
//! The pure core of the operator: resolve the desired sub-resource set from
//! a volume spec, diff it against observation, derive status, and drive one
//! convergence pass per queued volume key.

pub mod diff;
pub mod reconciler;
pub mod resolver;
pub mod status;

pub use diff::{plan, Plan, PlannedDelete, PlannedUpdate, DELETE_KIND_ORDER};
pub use reconciler::{Outcome, Reconciler};
pub use resolver::{parse_capacity, resolve, DesiredState, APPLY_KIND_ORDER};
pub use status::{aggregate, ObservedVolume, ReplicaObservation};
