//! OpenTelemetry metrics for the controller
//!
//! Instruments are no-ops until a meter provider is installed by telemetry
//! initialization.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("sidecar-cleaner"));

/// Counter of reconciliations
///
/// Labels:
/// - `result`: missing, terminal, waiting, already_cleaned, cleaned_up, error
pub static RECONCILES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("sidecar_cleaner_reconciles_total")
        .with_description("Total number of pod reconciliations by result")
        .with_unit("{reconciles}")
        .build()
});

/// Counter of shutdown commands issued
///
/// Labels:
/// - `result`: success, or the error kind
pub static CLEANUPS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("sidecar_cleaner_cleanups_total")
        .with_description("Total number of sidecar shutdown attempts by result")
        .with_unit("{cleanups}")
        .build()
});

/// Histogram of cleanup duration, exec plus confirmation
pub static CLEANUP_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("sidecar_cleaner_cleanup_duration_seconds")
        .with_description("Duration of sidecar cleanup in seconds")
        .with_unit("s")
        .build()
});

/// Counter of rate-limited retries
pub static REQUEUES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("sidecar_cleaner_requeues_total")
        .with_description("Total number of keys requeued after a failure")
        .with_unit("{requeues}")
        .build()
});

/// Counter of keys dropped after exhausting retries
///
/// Labels:
/// - `error_kind`: kind of the last error
pub static DROPPED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("sidecar_cleaner_dropped_total")
        .with_description("Total number of keys dropped after exhausting retries")
        .with_unit("{keys}")
        .build()
});

/// Single `result` label
pub fn result_label(result: &'static str) -> [KeyValue; 1] {
    [KeyValue::new("result", result)]
}
