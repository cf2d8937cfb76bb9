//! Prometheus metrics
//!
//! One [`Metrics`] handle is registered at startup and threaded through the
//! queue, worker pool, and reconciler. Per-phase volume counts are tracked
//! against the key's last known phase so gauge transitions stay exact.

use dashmap::DashMap;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use crate::crd::VolumePhase;
use crate::domain::VolumeKey;
use crate::error::{Error, Result};

/// Metric handles shared across the operator
pub struct Metrics {
    /// Reconcile requests currently queued
    pub queue_depth: IntGauge,
    /// Triggers collapsed into an already-pending request
    pub queue_coalesced: IntCounter,
    /// Triggers dropped because the queue was full
    pub queue_dropped: IntCounter,
    /// Completed passes by outcome (done, requeue, error, panic)
    pub passes: IntCounterVec,
    /// Wall-clock duration of reconciliation passes
    pub pass_duration: Histogram,

    volumes_by_phase: IntGaugeVec,
    phases: DashMap<VolumeKey, VolumePhase>,
}

impl Metrics {
    /// Build and register all metric handles against `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let queue_depth = IntGauge::new(
            "jiva_operator_queue_depth",
            "Reconcile requests currently queued",
        )
        .map_err(internal)?;
        let queue_coalesced = IntCounter::new(
            "jiva_operator_queue_coalesced_total",
            "Triggers merged into an already-pending request",
        )
        .map_err(internal)?;
        let queue_dropped = IntCounter::new(
            "jiva_operator_queue_dropped_total",
            "Triggers dropped because the queue was full",
        )
        .map_err(internal)?;
        let passes = IntCounterVec::new(
            Opts::new(
                "jiva_operator_reconcile_passes_total",
                "Reconciliation passes by outcome",
            ),
            &["outcome"],
        )
        .map_err(internal)?;
        let pass_duration = Histogram::with_opts(HistogramOpts::new(
            "jiva_operator_reconcile_duration_seconds",
            "Wall-clock duration of reconciliation passes",
        ))
        .map_err(internal)?;
        let volumes_by_phase = IntGaugeVec::new(
            Opts::new("jiva_operator_volumes", "Known volumes by phase"),
            &["phase"],
        )
        .map_err(internal)?;

        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(queue_coalesced.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(queue_dropped.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(passes.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(pass_duration.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(volumes_by_phase.clone()))
            .map_err(internal)?;

        Ok(Self {
            queue_depth,
            queue_coalesced,
            queue_dropped,
            passes,
            pass_duration,
            volumes_by_phase,
            phases: DashMap::new(),
        })
    }

    /// Record the phase a volume settled in after a status write
    pub fn observe_phase(&self, key: &VolumeKey, phase: VolumePhase) {
        let previous = self.phases.insert(key.clone(), phase);
        match previous {
            Some(old) if old == phase => {}
            Some(old) => {
                self.volumes_by_phase
                    .with_label_values(&[&old.to_string()])
                    .dec();
                self.volumes_by_phase
                    .with_label_values(&[&phase.to_string()])
                    .inc();
            }
            None => {
                self.volumes_by_phase
                    .with_label_values(&[&phase.to_string()])
                    .inc();
            }
        }
    }

    /// Drop per-phase accounting for a volume that no longer exists
    pub fn forget_volume(&self, key: &VolumeKey) {
        if let Some((_, old)) = self.phases.remove(key) {
            self.volumes_by_phase
                .with_label_values(&[&old.to_string()])
                .dec();
        }
    }

    /// Count one finished pass and its duration
    pub fn record_pass(&self, outcome: &str, seconds: f64) {
        self.passes.with_label_values(&[outcome]).inc();
        self.pass_duration.observe(seconds);
    }
}

fn internal(err: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Metrics {
        Metrics::new(&Registry::new()).unwrap()
    }

    #[test]
    fn test_phase_gauge_transitions() {
        let metrics = fresh();
        let key = VolumeKey::new("openebs", "pvc-1");

        metrics.observe_phase(&key, VolumePhase::Creating);
        metrics.observe_phase(&key, VolumePhase::Ready);
        assert_eq!(
            metrics
                .volumes_by_phase
                .with_label_values(&["Creating"])
                .get(),
            0
        );
        assert_eq!(
            metrics.volumes_by_phase.with_label_values(&["Ready"]).get(),
            1
        );

        // Re-observing the same phase does not double count
        metrics.observe_phase(&key, VolumePhase::Ready);
        assert_eq!(
            metrics.volumes_by_phase.with_label_values(&["Ready"]).get(),
            1
        );

        metrics.forget_volume(&key);
        assert_eq!(
            metrics.volumes_by_phase.with_label_values(&["Ready"]).get(),
            0
        );
    }

    #[test]
    fn test_pass_recording() {
        let metrics = fresh();
        metrics.record_pass("done", 0.01);
        metrics.record_pass("error", 0.5);
        assert_eq!(metrics.passes.with_label_values(&["done"]).get(), 1);
        assert_eq!(metrics.passes.with_label_values(&["error"]).get(), 1);
    }
}
