//! Metrics for the function controller
//!
//! - Reconcile duration and errors
//! - Time from Function creation (or last spec change) to each condition turning True
//! - Active build Jobs seen by the admission gate

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::crd::ConditionType;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("serverless"));

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Histogram of Function reconcile duration
///
/// Labels:
/// - `result`: success, error
pub static FUNCTION_RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("serverless_function_reconcile_duration_seconds")
        .with_description("Duration of Function reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of Function reconcile errors
///
/// Labels:
/// - `error_type`: transient, permanent
pub static FUNCTION_RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("serverless_function_reconcile_errors_total")
        .with_description("Total number of Function reconciliation errors")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Phase Transition Metrics
// ============================================================================

/// Histogram of time until a condition first became True for a generation
///
/// Labels:
/// - `condition`: ConfigurationReady, BuildReady, Running
/// - `source`: inline, git
pub static FUNCTION_PHASE_TRANSITION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("serverless_function_phase_transition_seconds")
        .with_description("Time from Function change until a condition turned True")
        .with_unit("s")
        .build()
});

// ============================================================================
// Build Metrics
// ============================================================================

/// Gauge of build Jobs that are neither failed nor succeeded
pub static BUILD_JOBS_ACTIVE: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("serverless_build_jobs_active")
        .with_description("Build Jobs currently running across the cluster")
        .with_unit("{jobs}")
        .build()
});

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Times one reconcile pass
pub struct ReconcileTimer {
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        FUNCTION_RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "success")],
        );
    }

    /// Record error completion
    pub fn error(self, retryable: bool) {
        FUNCTION_RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "error")],
        );
        let error_type = if retryable { "transient" } else { "permanent" };
        FUNCTION_RECONCILE_ERRORS.add(1, &[KeyValue::new("error_type", error_type)]);
    }
}

/// Record how long a Function took to reach a True condition
pub fn record_phase_transition(condition: ConditionType, source: &'static str, seconds: f64) {
    FUNCTION_PHASE_TRANSITION.record(
        seconds,
        &[
            KeyValue::new("condition", condition.to_string()),
            KeyValue::new("source", source),
        ],
    );
}

/// Update the active build Jobs gauge
pub fn set_active_build_jobs(count: usize) {
    BUILD_JOBS_ACTIVE.record(count as u64, &[]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_timer_records_without_provider() {
        ReconcileTimer::start().success();
        ReconcileTimer::start().error(true);
        ReconcileTimer::start().error(false);
    }

    #[test]
    fn helpers_record_without_provider() {
        record_phase_transition(ConditionType::Running, "inline", 12.5);
        set_active_build_jobs(3);
    }
}
