//! Integration tests for telemetry initialization and span helpers.

use harvest_rs::model::TaskId;
use uuid::Uuid;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = harvest_rs::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "harvest-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    if let Ok(guard) = harvest_rs::telemetry::init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn call_span_creates_and_records_attempts() {
    let span = harvest_rs::telemetry::call::start_call_span("imagen", &Uuid::new_v4());
    harvest_rs::telemetry::call::record_attempts(&span, 3);
}

#[test]
fn task_span_creates_and_records_transition() {
    let id = TaskId::new();
    let span = harvest_rs::telemetry::task::start_task_span("banner", &id, 1);
    harvest_rs::telemetry::task::record_state_transition(&span, "claimed", "done");
}

#[test]
fn metric_instruments_build_without_a_provider() {
    use harvest_rs::telemetry::metrics;
    use opentelemetry::KeyValue;

    metrics::tasks_claimed().add(1, &[KeyValue::new("kind", "banner")]);
    metrics::call_duration_ms().record(12.5, &[KeyValue::new("class", "ok")]);
}
