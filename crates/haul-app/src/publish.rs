//! Event publication shared by the orchestration services.

use haul_events::{Event, EventBus};
use haul_telemetry::Metrics;
use tracing::trace;

/// Bus handle that counts every event it publishes.
#[derive(Clone)]
pub struct Publisher {
    events: EventBus,
    metrics: Metrics,
}

impl Publisher {
    /// Wrap a bus and the metrics registry.
    #[must_use]
    pub const fn new(events: EventBus, metrics: Metrics) -> Self {
        Self { events, metrics }
    }

    /// Publish without waiting on subscribers.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        self.metrics.inc_event(kind);
        let id = self.events.publish(event);
        trace!(event_id = id, kind, "published event");
    }

    /// Underlying bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.events
    }

    /// Metrics registry.
    #[must_use]
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
