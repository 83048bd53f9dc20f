//! # harvest-rs
//!
//! Claim-based task backlog and resilient external-call plumbing for
//! batch content pipelines.
//!
//! Provides a Postgres-backed claim state machine (with an in-memory
//! store for tests and single-process runs), a rate-limited call queue
//! with credential fallback, single-flight + circuit breaker call
//! guarding, near-duplicate title clustering, and OpenTelemetry
//! observability.

pub mod claim;
pub mod client;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod model;
pub mod net;
pub mod retry;
pub mod runner;
pub mod telemetry;
