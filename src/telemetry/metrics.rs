//! Metric instrument factories for visitq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"visitq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Instrumentation scope for every visitq meter and tracer.
pub const METER_NAME: &str = "visitq";

fn meter() -> Meter {
    opentelemetry::global::meter(METER_NAME)
}

/// Counter: committed visit status transitions.
/// Labels: `from`, `to`.
pub fn visit_transitions() -> Counter<u64> {
    meter()
        .u64_counter("visitq.visit.transitions")
        .with_description("Number of committed visit status transitions")
        .build()
}

/// Counter: mutation queue operations.
/// Labels: `operation` ("enqueue" | "duplicate" | "commit" | "retry" | "fail" | "dismiss").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("visitq.queue.operations")
        .with_description("Number of mutation queue operations")
        .build()
}

/// Counter: queued mutations discarded because the remote moved past them.
/// Labels: `kind`.
pub fn queue_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("visitq.queue.conflicts")
        .with_description("Queued mutations discarded on conflict")
        .build()
}

/// Counter: notification dispatch attempts.
/// Labels: `result` ("ok" | "error" | "timeout").
pub fn notifications() -> Counter<u64> {
    meter()
        .u64_counter("visitq.notifications")
        .with_description("Number of notification dispatch attempts")
        .build()
}

/// Histogram: duration of a queue drain in milliseconds.
pub fn drain_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("visitq.drain.duration_ms")
        .with_description("Queue drain duration in milliseconds")
        .with_unit("ms")
        .build()
}
