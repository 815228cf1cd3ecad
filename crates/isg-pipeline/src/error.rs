//! Pipeline error type and its stable classification
//!
//! Component errors pass through unchanged; [`ErrorKind`] is the
//! coarse label surfaced to callers and logs.

use crate::config::ConfigError;
use crate::proposer::ProposerError;
use isg_core::CandidateId;
use isg_graph::{AuditError, CandidateError, CommitError, GraphError, RollbackError, StorageError};
use isg_retrieval::RetrievalError;
use isg_validation::GateError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaConflict,
    CandidateConflict,
    ValidationTimeout,
    ValidationFailed,
    CommitPrecondition,
    StorageIo,
    Retrieval,
    Proposer,
    Config,
    Other,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SchemaConflict => "schema_conflict",
            Self::CandidateConflict => "candidate_conflict",
            Self::ValidationTimeout => "validation_timeout",
            Self::ValidationFailed => "validation_failed",
            Self::CommitPrecondition => "commit_precondition",
            Self::StorageIo => "storage_io",
            Self::Retrieval => "retrieval",
            Self::Proposer => "proposer",
            Self::Config => "config",
            Self::Other => "other",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Candidate(#[from] CandidateError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Proposer(#[from] ProposerError),

    /// No candidate awaiting review under this id
    #[error("candidate {0} is not awaiting review")]
    UnknownReview(CandidateId),
}

impl PipelineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Graph(e) if e.is_schema_conflict() => ErrorKind::SchemaConflict,
            Self::Graph(GraphError::Storage(_))
            | Self::Storage(_)
            | Self::Candidate(CandidateError::Storage(_))
            | Self::Commit(CommitError::Storage(_))
            | Self::Rollback(RollbackError::Storage(_))
            | Self::Gate(GateError::Log(_)) => ErrorKind::StorageIo,
            Self::Commit(CommitError::Graph(e)) if e.is_schema_conflict() => ErrorKind::SchemaConflict,
            Self::Candidate(CandidateError::Conflict { .. }) | Self::Graph(GraphError::EntityLocked { .. }) => {
                ErrorKind::CandidateConflict
            }
            Self::Commit(CommitError::Precondition { .. }) => ErrorKind::CommitPrecondition,
            Self::Retrieval(_) => ErrorKind::Retrieval,
            Self::Proposer(_) => ErrorKind::Proposer,
            _ => ErrorKind::Other,
        }
    }

    /// Whether repeating the same call could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Proposer(ProposerError::Unavailable(_)) | Self::Retrieval(RetrievalError::IndexUnavailable(_))
        ) || self.kind() == ErrorKind::StorageIo
    }
}
