//! Failure taxonomy shared by every retry decision in the crate.
//!
//! Classification looks at the HTTP status first. When there is no status,
//! or the status carries no meaning of its own (redirects, teapots), the
//! message is matched against known substrings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What kind of failure happened, and therefore what to do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Credentials missing, expired or rejected.
    AuthRequired,
    /// The request itself is invalid; resending it cannot help.
    BadRequest,
    /// The target does not exist.
    NotFound,
    /// The call did not finish in time.
    Timeout,
    /// Transient: 408/429/5xx, quota, resets, offline.
    Retryable,
    /// Synthesized locally while the breaker for the key is open.
    CircuitOpen,
    /// Anything else. Treated as a logic error.
    Unknown,
}

impl ErrorClass {
    /// Worth another attempt after backoff?
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Retryable | ErrorClass::Timeout)
    }

    /// Surfaces to the caller immediately, without touching the breaker.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorClass::AuthRequired
                | ErrorClass::BadRequest
                | ErrorClass::NotFound
                | ErrorClass::Unknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::AuthRequired => "auth_required",
            ErrorClass::BadRequest => "bad_request",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Retryable => "retryable",
            ErrorClass::CircuitOpen => "circuit_open",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of an outbound call.
///
/// Cloneable so one settled outcome can be handed to every caller that
/// attached to the same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct CallError {
    pub class: ErrorClass,
    pub status: Option<u16>,
    pub message: String,
}

impl CallError {
    /// Build an error, classifying it from status and message.
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: classify(status, &message),
            status,
            message,
        }
    }

    /// Build an error with a known class, bypassing classification.
    pub fn with_class(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            status: None,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self::new(Some(status), body)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::with_class(
            ErrorClass::Timeout,
            format!("timed out after {}ms", after.as_millis()),
        )
    }

    pub fn circuit_open(key: &str) -> Self {
        Self::with_class(ErrorClass::CircuitOpen, format!("circuit open for {key}"))
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::with_class(ErrorClass::Timeout, e.to_string());
        }
        if e.is_connect() {
            return Self::with_class(ErrorClass::Retryable, e.to_string());
        }
        Self::new(e.status().map(|s| s.as_u16()), e.to_string())
    }
}

/// Classify a raw failure.
pub fn classify(status: Option<u16>, message: &str) -> ErrorClass {
    if let Some(class) = status.and_then(classify_status) {
        return class;
    }
    classify_message(message)
}

fn classify_status(status: u16) -> Option<ErrorClass> {
    match status {
        401 | 403 => Some(ErrorClass::AuthRequired),
        404 | 410 => Some(ErrorClass::NotFound),
        408 | 429 => Some(ErrorClass::Retryable),
        400 | 405 | 409 | 413 | 415 | 422 => Some(ErrorClass::BadRequest),
        500..=599 => Some(ErrorClass::Retryable),
        _ => None,
    }
}

const CIRCUIT_MARKERS: &[&str] = &["circuit open", "circuit breaker"];
const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "deadline exceeded", "etimedout"];
const AUTH_MARKERS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "permission denied",
    "forbidden",
    "invalid token",
    "token expired",
    "invalid_grant",
    "login required",
];
const SAFETY_MARKERS: &[&str] = &["safety", "blocked", "content policy", "responsible ai"];
const RETRYABLE_MARKERS: &[&str] = &[
    "rate limit",
    "too many requests",
    "quota",
    "resource_exhausted",
    "resource exhausted",
    "overloaded",
    "unavailable",
    "internal server error",
    "bad gateway",
    "econnreset",
    "connection reset",
    "connection refused",
    "econnrefused",
    "socket hang up",
    "broken pipe",
    "network",
    "offline",
    "fetch failed",
    "temporarily",
    "try again",
];
const NOT_FOUND_MARKERS: &[&str] = &["not found", "no such", "does not exist"];
const BAD_REQUEST_MARKERS: &[&str] = &["bad request", "invalid", "validation", "malformed"];

fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    // Order matters: "invalid token" is auth, not a bad request; a
    // safety rejection is never worth retrying even if it says "try again".
    if has(CIRCUIT_MARKERS) {
        ErrorClass::CircuitOpen
    } else if has(TIMEOUT_MARKERS) {
        ErrorClass::Timeout
    } else if has(AUTH_MARKERS) {
        ErrorClass::AuthRequired
    } else if has(SAFETY_MARKERS) {
        ErrorClass::BadRequest
    } else if has(RETRYABLE_MARKERS) {
        ErrorClass::Retryable
    } else if has(NOT_FOUND_MARKERS) {
        ErrorClass::NotFound
    } else if has(BAD_REQUEST_MARKERS) {
        ErrorClass::BadRequest
    } else {
        ErrorClass::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wins_over_message() {
        assert_eq!(classify(Some(401), "rate limit"), ErrorClass::AuthRequired);
        assert_eq!(classify(Some(429), "invalid"), ErrorClass::Retryable);
        assert_eq!(classify(Some(404), ""), ErrorClass::NotFound);
        assert_eq!(classify(Some(400), "quota"), ErrorClass::BadRequest);
    }

    #[test]
    fn transient_statuses_are_retryable() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert_eq!(classify(Some(status), ""), ErrorClass::Retryable, "{status}");
        }
    }

    #[test]
    fn unmapped_status_falls_back_to_message() {
        assert_eq!(classify(Some(418), "socket hang up"), ErrorClass::Retryable);
        assert_eq!(classify(Some(302), ""), ErrorClass::Unknown);
    }

    #[test]
    fn message_fallback_when_status_absent() {
        assert_eq!(classify(None, "ECONNRESET"), ErrorClass::Retryable);
        assert_eq!(classify(None, "Quota exceeded for model"), ErrorClass::Retryable);
        assert_eq!(classify(None, "request timed out"), ErrorClass::Timeout);
        assert_eq!(classify(None, "Invalid token supplied"), ErrorClass::AuthRequired);
        assert_eq!(classify(None, "model not found"), ErrorClass::NotFound);
        assert_eq!(classify(None, "validation failed: prompt"), ErrorClass::BadRequest);
        assert_eq!(classify(None, "something odd"), ErrorClass::Unknown);
    }

    #[test]
    fn safety_rejections_are_never_retried() {
        let err = CallError::new(None, "Image blocked by safety filter, try again later");
        assert_eq!(err.class, ErrorClass::BadRequest);
        assert!(!err.is_retryable());
    }

    #[test]
    fn terminal_and_retryable_partition() {
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(ErrorClass::Retryable.is_retryable());
        assert!(!ErrorClass::CircuitOpen.is_retryable());
        assert!(!ErrorClass::CircuitOpen.is_terminal());
        assert!(ErrorClass::Unknown.is_terminal());
        assert!(ErrorClass::AuthRequired.is_terminal());
    }
}
