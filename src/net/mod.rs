//! Network resilience: failure taxonomy, circuit breaker, single-flight
//! caller and the HTTP transport seam.

pub mod breaker;
pub mod caller;
pub mod classify;
pub mod transport;

pub use breaker::{BreakerConfig, BreakerPhase, CircuitBreaker, CircuitState};
pub use caller::{CallerConfig, ResilientCaller};
pub use classify::{CallError, ErrorClass, classify};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
