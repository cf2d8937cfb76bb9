//! Reconcile scheduling: the coalescing work queue and the worker pool
//! that drains it.

pub mod queue;
pub mod worker;

pub use queue::WorkQueue;
pub use worker::{PassDriver, WorkerPool};
