//! Metric instrument factories for harvest-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"harvest-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for harvest-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("harvest-rs")
}

/// Counter: tasks successfully claimed by this process.
pub fn tasks_claimed() -> Counter<u64> {
    meter()
        .u64_counter("harvest.task.claimed")
        .with_description("Number of tasks claimed")
        .build()
}

/// Counter: conditional claim writes lost to another worker.
pub fn claim_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("harvest.task.claim_conflicts")
        .with_description("Number of claims lost to a concurrent worker")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("harvest.task.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: settled outbound calls.
/// Labels: `class` ("ok" or an error class).
pub fn call_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("harvest.call.outcomes")
        .with_description("Number of settled outbound calls")
        .build()
}

/// Counter: backoff retries of outbound calls.
pub fn call_retries() -> Counter<u64> {
    meter()
        .u64_counter("harvest.call.retries")
        .with_description("Number of outbound call retries")
        .build()
}

/// Counter: circuit breaker trips.
pub fn breaker_opened() -> Counter<u64> {
    meter()
        .u64_counter("harvest.breaker.opened")
        .with_description("Number of times a circuit breaker opened")
        .build()
}

/// Counter: near-duplicate items detected.
pub fn dedup_matches() -> Counter<u64> {
    meter()
        .u64_counter("harvest.dedup.matches")
        .with_description("Number of near-duplicate items detected")
        .build()
}

/// Histogram: outbound call duration in milliseconds, retries included.
/// Labels: `class`.
pub fn call_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("harvest.call.duration_ms")
        .with_description("Outbound call duration in milliseconds")
        .with_unit("ms")
        .build()
}
