//! Metric instrument factories for cascade-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op and these cost
//! next to nothing.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("cascade-rs")
}

/// Counter: scheduling turns.
/// Labels: `outcome` ("queue_full" | "denied" | "drained" | "fatal").
pub fn turns() -> Counter<u64> {
    meter()
        .u64_counter("cascade.turns")
        .with_description("Number of scheduling turns")
        .build()
}

/// Counter: descriptors accepted by the batch service.
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("cascade.jobs.submitted")
        .with_description("Number of job descriptors accepted by the batch service")
        .build()
}

/// Counter: rejected submit attempts.
pub fn submit_failures() -> Counter<u64> {
    meter()
        .u64_counter("cascade.submit.failures")
        .with_description("Number of failed submit attempts")
        .build()
}

/// Counter: turns that found the scheduler lock taken.
pub fn lock_denied() -> Counter<u64> {
    meter()
        .u64_counter("cascade.lock.denied")
        .with_description("Number of turns denied the scheduler lock")
        .build()
}

/// Histogram: turn duration in milliseconds.
pub fn turn_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("cascade.turn.duration_ms")
        .with_description("Scheduling turn duration in milliseconds")
        .with_unit("ms")
        .build()
}
