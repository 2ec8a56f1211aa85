use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::models::{Arch, JobStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Record store {} is unreadable: {reason}", path.display())]
    CorruptStore { path: PathBuf, reason: String },

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Unresolved template placeholder: {0}")]
    UnresolvedPlaceholder(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("No enabled remote build node available for {0}")]
    NoAvailableNode(Arch),

    #[error("Remote execution error: {0}")]
    RemoteExecution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// True for the template failures raised while rendering a job spec.
    pub fn is_template(&self) -> bool {
        matches!(self, Error::UnresolvedPlaceholder(_) | Error::Template(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
