//! Custom Resource Definitions for the JivaVolume operator
//!
//! This module contains the single CRD the operator reconciles:
//! - JivaVolume: a replicated block volume (controller + N replicas)

pub mod jiva_volume;

pub use jiva_volume::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;
