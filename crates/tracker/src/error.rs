//! Error types of the tracker engine.
//!
//! Only infrastructure failures travel through these types. Validation,
//! not-found and integrity outcomes of a request are values of the
//! outcome enums in [`placement`](crate::placement) and are never errors.

use thiserror::Error;
use tracker_common::{NodeId, TaskId};

/// Failure reported by a repository backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepoError {
    /// Backend cannot serve requests right now.
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness constraint would be violated.
    #[error("constraint violated: {0}")]
    Conflict(String),

    /// A row addressed by id does not exist.
    #[error("row not found: {0}")]
    NotFound(String),
}

/// Error returned by tracker operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("repository error: {0}")]
    Repository(#[from] RepoError),

    /// The caller's deadline passed; the transaction was rolled back.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("unknown provider {0}")]
    UnknownProvider(NodeId),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
