//! Task execution span helpers.
//!
//! Provides span creation and state-transition recording for tasks
//! flowing through a job run.

use tracing::Span;

use crate::model::TaskId;

/// Start a span for processing one claimed task.
///
/// The `task.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_task_span(kind: &str, id: &TaskId, attempt: u32) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.kind" = kind,
        "task.id" = %id.0,
        "task.attempt" = attempt,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
