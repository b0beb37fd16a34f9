//! Observability metrics for the orchestration engine.
//!
//! Metrics are exposed via the `metrics` crate facade; the entry-point
//! binary installs a Prometheus exporter. Names live in [`names`] so
//! dashboards and alerts reference one source of truth.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `opsbridge_events_total` | Counter | `event_kind`, `status` | Handled events by outcome |
//! | `opsbridge_guard_acquisitions_total` | Counter | `outcome` | Guard lease attempts |
//! | `opsbridge_runner_starts_total` | Counter | `outcome` | Job start calls |
//! | `opsbridge_runner_poll_ticks_total` | Counter | - | Execution poll ticks |
//! | `opsbridge_notes_total` | Counter | - | Timeline notes written |
//! | `opsbridge_mirror_writes_total` | Counter | `outcome` | Mirror/ready signal writes |
//! | `opsbridge_report_collect_seconds` | Histogram | - | Poll-to-normalized-report latency |

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: handled events by kind and outcome status.
    pub const EVENTS_TOTAL: &str = "opsbridge_events_total";
    /// Counter: guard lease acquisition attempts by outcome.
    pub const GUARD_ACQUISITIONS_TOTAL: &str = "opsbridge_guard_acquisitions_total";
    /// Counter: job start calls by outcome.
    pub const RUNNER_STARTS_TOTAL: &str = "opsbridge_runner_starts_total";
    /// Counter: execution poll ticks.
    pub const RUNNER_POLL_TICKS_TOTAL: &str = "opsbridge_runner_poll_ticks_total";
    /// Counter: timeline notes written.
    pub const NOTES_TOTAL: &str = "opsbridge_notes_total";
    /// Counter: mirror/ready signal writes by outcome.
    pub const MIRROR_WRITES_TOTAL: &str = "opsbridge_mirror_writes_total";
    /// Histogram: poll-to-normalized-report latency in seconds.
    pub const REPORT_COLLECT_SECONDS: &str = "opsbridge_report_collect_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Event kind (`incident.created`, `workflow.run`, ...).
    pub const EVENT_KIND: &str = "event_kind";
    /// Outcome status string of a handled event.
    pub const STATUS: &str = "status";
    /// Generic outcome label (acquired, suppressed, error, ...).
    pub const OUTCOME: &str = "outcome";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to copy and share; all state lives in the metrics registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a handled event and its outcome status.
    pub fn record_event(self, event_kind: &str, status: &str) {
        counter!(
            names::EVENTS_TOTAL,
            labels::EVENT_KIND => event_kind.to_string(),
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Records a guard acquisition outcome.
    pub fn record_guard(self, outcome: &str) {
        counter!(
            names::GUARD_ACQUISITIONS_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records a job start outcome.
    pub fn record_start(self, outcome: &str) {
        counter!(
            names::RUNNER_STARTS_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records one execution poll tick.
    pub fn record_poll_tick(self) {
        counter!(names::RUNNER_POLL_TICKS_TOTAL).increment(1);
    }

    /// Records a timeline note write.
    pub fn record_note(self) {
        counter!(names::NOTES_TOTAL).increment(1);
    }

    /// Records a mirror/ready signal write outcome.
    pub fn record_mirror(self, outcome: &str) {
        counter!(
            names::MIRROR_WRITES_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records the poll-to-report latency for one execution.
    pub fn observe_report_collect(self, seconds: f64) {
        histogram!(names::REPORT_COLLECT_SECONDS).record(seconds);
    }
}
