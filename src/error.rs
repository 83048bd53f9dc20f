//! Error types for harvest-rs.

use thiserror::Error;

use crate::model::TaskState;
use crate::net::CallError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no credential provider succeeded: {0}")]
    Credentials(String),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
