//! Observability metrics for the export engine.
//!
//! Exported via the `metrics` crate facade; install any compatible
//! recorder (e.g. the Prometheus exporter) in the hosting process.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tessera_engine_dispatches_total` | Counter | `step_kind` | Task queries dispatched |
//! | `tessera_engine_completions_total` | Counter | `step_kind` | Task completions recorded |
//! | `tessera_engine_delivery_anomalies_total` | Counter | `step_kind` | Dropped progress events |
//! | `tessera_engine_tasks_in_flight` | Gauge | `step_kind` | Dispatched but unacknowledged tasks |
//! | `tessera_engine_step_progress` | Gauge | `step_kind` | Progress fraction in `[0, 1]` |
//! | `tessera_engine_pick_next_duration_seconds` | Histogram | `step_kind` | Pick-next round trip |

use std::time::Instant;

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: task queries dispatched.
    pub const DISPATCHES_TOTAL: &str = "tessera_engine_dispatches_total";
    /// Counter: task completions recorded.
    pub const COMPLETIONS_TOTAL: &str = "tessera_engine_completions_total";
    /// Counter: progress events dropped as anomalies.
    pub const DELIVERY_ANOMALIES_TOTAL: &str = "tessera_engine_delivery_anomalies_total";
    /// Gauge: dispatched but unacknowledged tasks.
    pub const TASKS_IN_FLIGHT: &str = "tessera_engine_tasks_in_flight";
    /// Gauge: step progress fraction.
    pub const STEP_PROGRESS: &str = "tessera_engine_step_progress";
    /// Histogram: pick-next round-trip duration in seconds.
    pub const PICK_NEXT_DURATION_SECONDS: &str = "tessera_engine_pick_next_duration_seconds";
}

/// Metric label keys.
pub mod labels {
    /// The step kind the series belongs to.
    pub const STEP_KIND: &str = "step_kind";
}

/// Handle for recording engine metrics.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    step_kind: &'static str,
}

impl EngineMetrics {
    /// Creates a metrics handle for one step kind.
    #[must_use]
    pub const fn new(step_kind: &'static str) -> Self {
        Self { step_kind }
    }

    /// Records one task dispatch.
    pub fn record_dispatch(&self) {
        counter!(names::DISPATCHES_TOTAL, labels::STEP_KIND => self.step_kind).increment(1);
    }

    /// Records one recorded task completion.
    pub fn record_completion(&self) {
        counter!(names::COMPLETIONS_TOTAL, labels::STEP_KIND => self.step_kind).increment(1);
    }

    /// Records one dropped progress event.
    pub fn record_delivery_anomaly(&self) {
        counter!(names::DELIVERY_ANOMALIES_TOTAL, labels::STEP_KIND => self.step_kind).increment(1);
    }

    /// Updates the in-flight task gauge.
    pub fn set_tasks_in_flight(&self, in_flight: u32) {
        gauge!(names::TASKS_IN_FLIGHT, labels::STEP_KIND => self.step_kind)
            .set(f64::from(in_flight));
    }

    /// Updates the progress-fraction gauge.
    pub fn set_step_progress(&self, fraction: f32) {
        gauge!(names::STEP_PROGRESS, labels::STEP_KIND => self.step_kind)
            .set(f64::from(fraction));
    }

    /// Observes one pick-next round trip.
    pub fn observe_pick_next(&self, started: Instant) {
        histogram!(names::PICK_NEXT_DURATION_SECONDS, labels::STEP_KIND => self.step_kind)
            .record(started.elapsed().as_secs_f64());
    }
}
