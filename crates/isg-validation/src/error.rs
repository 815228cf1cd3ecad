//! Validation error types
//!
//! [`ValidationError`] covers infrastructure failures inside a run. The gate
//! never propagates those: they become a `Failed(Infrastructure)` verdict.
//! [`GateError`] is what callers of the gate see, and only when no run
//! could be recorded at all.

use isg_core::{CandidateId, EntityId, ValidationPhase};
use isg_graph::{GraphError, StorageError};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition { from: ValidationPhase, to: ValidationPhase },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("entity {0} has no source location")]
    MissingLocation(EntityId),

    #[error("source of {entity} in {file} no longer matches the graph")]
    StaleSource { entity: EntityId, file: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("analysis session: {0}")]
    Session(String),

    #[error("background task failed: {0}")]
    Join(String),
}

impl ValidationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("candidate {0} is not pending")]
    NotPending(CandidateId),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("failed to record validation result: {0}")]
    Log(#[from] StorageError),
}
