//! Operator configuration
//!
//! One immutable [`OperatorConfig`] is built from CLI/environment input at
//! process start and passed by reference into every component constructor.
//! Nothing in the reconciliation loop reaches for ambient global state.

use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Operator Config
// =============================================================================

/// Top-level configuration for the operator process
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace the operator watches and creates sub-resources in
    pub namespace: String,

    /// Number of reconcile workers draining the queue
    pub workers: usize,

    /// Upper bound on queued reconcile requests
    pub queue_capacity: usize,

    /// Deadline applied to every state-store call
    pub api_timeout: Duration,

    /// Requeue interval while a volume is still converging
    pub requeue_converging: Duration,

    /// Backoff policy for transient reconcile failures
    pub backoff: BackoffConfig,

    /// How long the controller may stay unreachable before the volume
    /// is marked Failed
    pub controller_retry_budget: Duration,

    /// Engine images and claim defaults used when rendering sub-resources
    pub engine: EngineConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "openebs".to_string(),
            workers: 4,
            queue_capacity: 512,
            api_timeout: Duration::from_secs(15),
            requeue_converging: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            controller_retry_budget: Duration::from_secs(300),
            engine: EngineConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Validate operational bounds before the worker pool starts
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Configuration(
                "watch namespace must not be empty".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(Error::Configuration(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Configuration(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(Error::Configuration(
                "backoff multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.backoff.initial > self.backoff.max {
            return Err(Error::Configuration(
                "initial backoff must not exceed max backoff".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Backoff Config
// =============================================================================

/// Bounds for the per-key exponential backoff applied to transient failures
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First retry delay
    pub initial: Duration,

    /// Ceiling for the retry delay
    pub max: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

// =============================================================================
// Engine Config
// =============================================================================

/// Jiva engine settings applied to every rendered sub-resource
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Image for the controller workload
    pub controller_image: String,

    /// Image for replica workloads
    pub replica_image: String,

    /// Storage class for backing claims when the volume spec names none
    pub default_storage_class: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            controller_image: "openebs/jiva:3.6.2".to_string(),
            replica_image: "openebs/jiva:3.6.2".to_string(),
            default_storage_class: None,
        }
    }
}
