//! Event sinks
//!
//! Human-readable progress notifications. Sinks are strictly best-effort:
//! the Kubernetes-backed sink publishes from a detached task so a slow or
//! failing events API can never stall a reconciliation pass.

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::crd::JivaVolume;
use crate::domain::{EventSeverity, EventSink};

/// Component name stamped onto published events
pub const REPORTER_NAME: &str = "jivavolume-controller";

// =============================================================================
// Kubernetes Event Sink
// =============================================================================

/// Publishes cluster Events attached to the volume resource
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: REPORTER_NAME.to_string(),
                instance: None,
            },
        }
    }
}

impl EventSink for KubeEventSink {
    fn publish(&self, volume: &JivaVolume, severity: EventSeverity, reason: &str, message: &str) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            volume.object_ref(&()),
        );
        let event = Event {
            type_: match severity {
                EventSeverity::Normal => EventType::Normal,
                EventSeverity::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        tokio::spawn(async move {
            if let Err(err) = recorder.publish(event).await {
                debug!(error = %err, "failed to publish event");
            }
        });
    }
}

// =============================================================================
// Log Event Sink
// =============================================================================

/// Fallback sink that mirrors notifications into the operator log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn publish(&self, volume: &JivaVolume, severity: EventSeverity, reason: &str, message: &str) {
        let name = volume.metadata.name.as_deref().unwrap_or("<unnamed>");
        match severity {
            EventSeverity::Normal => info!(volume = name, reason, message),
            EventSeverity::Warning => warn!(volume = name, reason, message),
        }
    }
}

// =============================================================================
// Memory Event Sink
// =============================================================================

/// One captured notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub volume: String,
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

/// Capturing sink used by tests to assert on published notifications
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured events so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Whether any captured event carries the given reason
    pub fn has_reason(&self, reason: &str) -> bool {
        self.events.lock().iter().any(|e| e.reason == reason)
    }
}

impl EventSink for MemoryEventSink {
    fn publish(&self, volume: &JivaVolume, severity: EventSeverity, reason: &str, message: &str) {
        self.events.lock().push(RecordedEvent {
            volume: volume.metadata.name.clone().unwrap_or_default(),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::JivaVolumeSpec;

    #[test]
    fn test_memory_sink_captures_in_order() {
        let sink = MemoryEventSink::new();
        let volume = JivaVolume::new(
            "pvc-1",
            JivaVolumeSpec {
                capacity: "5Gi".into(),
                ..Default::default()
            },
        );

        sink.publish(&volume, EventSeverity::Normal, "Provisioning", "creating");
        sink.publish(&volume, EventSeverity::Warning, "VolumeDegraded", "1 of 3");

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason, "Provisioning");
        assert_eq!(events[1].severity, EventSeverity::Warning);
        assert!(sink.has_reason("VolumeDegraded"));
        assert!(!sink.has_reason("Deleted"));
    }
}
