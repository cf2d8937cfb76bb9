//! Domain layer - Port definitions and shared reconciliation types
//!
//! This module defines the traits (ports) the reconciler depends on and the
//! descriptor/observation types exchanged across them. Adapters in `store`
//! and `events` implement the ports.

pub mod ports;

pub use ports::*;
