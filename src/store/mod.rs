//! Store adapters
//!
//! One adapter per backing technology for the domain ports: the Kubernetes
//! API for volume records and sub-resources, the jiva controller REST API
//! for replica probing, and an in-memory double driving deterministic tests.

pub mod kube;
pub mod memory;
pub mod target;

pub use self::kube::KubeStore;
pub use memory::{InMemoryStore, ScriptedProbe, StoreOp};
pub use target::TargetApiProbe;
