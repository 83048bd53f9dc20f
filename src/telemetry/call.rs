//! Outbound call span helpers.
//!
//! Every call dispatched through the rate-limited queue gets a correlation
//! id. The span carries it, and the `call.*` events emitted inside it are
//! what operators grep for when an upstream misbehaves.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one dispatched outbound call.
///
/// `call.attempts` is filled in when the call settles via
/// [`record_attempts`].
pub fn start_call_span(target: &str, call_id: &Uuid) -> Span {
    tracing::info_span!(
        "call.dispatch",
        "call.target" = target,
        "call.id" = %call_id,
        "call.attempts" = tracing::field::Empty,
    )
}

/// Record how many attempts a call took.
pub fn record_attempts(span: &Span, attempts: u32) {
    span.record("call.attempts", attempts);
}
