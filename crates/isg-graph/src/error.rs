//! Error types for the graph store
//!
//! Each writer has its own error enum so callers can match on the
//! failure kinds that writer can actually produce.

use isg_core::{CandidateId, CommitId, EntityId, EntityKind, FutureAction, HashError};
use std::path::PathBuf;

/// Storage failures, surfaced only after retries are exhausted
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem failure
    #[error("storage io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot could not be encoded or decoded
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Retries exhausted
    #[error("storage write failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<StorageError> },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Entity graph store errors
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Id collides with an entity of a different kind
    #[error("schema conflict on {id}: stored as {existing}, upserted as {incoming}")]
    SchemaConflict {
        id: EntityId,
        existing: EntityKind,
        incoming: EntityKind,
    },

    /// Edge endpoint does not exist
    #[error("schema conflict: edge {from} -> {to} has no endpoint {missing}")]
    DanglingEdge {
        from: EntityId,
        to: EntityId,
        missing: EntityId,
    },

    /// Extracted edges may not carry a candidate tag
    #[error("schema conflict: extracted edge {from} -> {to} is tagged with candidate {candidate}")]
    TaggedEdge {
        from: EntityId,
        to: EntityId,
        candidate: CandidateId,
    },

    /// Upsert would change code under an in-flight candidate
    #[error("entity {id} is locked by in-flight candidate {candidate}")]
    EntityLocked { id: EntityId, candidate: CandidateId },

    /// Entity not found
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    /// Candidate not found or not pending
    #[error("no pending candidate {0}")]
    CandidateNotPending(CandidateId),

    /// Persistence failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl GraphError {
    /// True for the schema-conflict family
    #[inline]
    #[must_use]
    pub fn is_schema_conflict(&self) -> bool {
        matches!(
            self,
            Self::SchemaConflict { .. } | Self::DanglingEdge { .. } | Self::TaggedEdge { .. }
        )
    }
}

/// Why the candidate store refused a submission on policy grounds
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("candidate has no mutations")]
    Empty,

    #[error("candidate changes {count} entities, limit is {max}")]
    TooManyEntities { count: usize, max: usize },

    #[error("candidate diff is {bytes} bytes, limit is {max}")]
    DiffTooLarge { bytes: usize, max: usize },

    #[error("candidate targets {first} and {second}, which overlap")]
    OverlappingTargets { first: EntityId, second: EntityId },

    #[error("{action:?} of {entity} is invalid: {reason}")]
    InvalidMutation {
        entity: EntityId,
        action: FutureAction,
        reason: String,
    },

    #[error("proposed edge {from} -> {to} has no endpoint in the projected graph")]
    DanglingProposedEdge { from: EntityId, to: EntityId },
}

/// Candidate store errors
#[derive(Debug, thiserror::Error)]
pub enum CandidateError {
    /// A target already has an in-flight candidate
    #[error("candidate conflict: {entity} overlaps {held} held by candidate {holder}")]
    Conflict {
        entity: EntityId,
        held: EntityId,
        holder: CandidateId,
    },

    /// Schema validation failed
    #[error("candidate rejected: {0}")]
    Policy(#[from] PolicyViolation),

    #[error("candidate not found: {0}")]
    NotFound(CandidateId),

    /// Candidate is already committed or discarded
    #[error("candidate {0} is closed")]
    Closed(CandidateId),

    #[error("candidate hash error: {0}")]
    Hash(#[from] HashError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Unmet commit precondition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Precondition {
    #[error("candidate has never been validated")]
    NotValidated,

    #[error("latest validation did not pass")]
    NotPassed,

    #[error("confidence report is for run {report}, latest run is {latest}")]
    StaleReport { report: String, latest: String },

    #[error("confidence report is for another candidate")]
    ForeignReport,

    #[error("confidence gate is {0}, not auto-apply")]
    GateNotAutoApply(isg_core::Gate),

    #[error("reviewer {0} rejected the candidate")]
    HumanRejected(String),

    #[error("candidate is not pending")]
    NotPending,
}

/// Commit errors
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// Distinct precondition kind: never retried, never downgraded
    #[error("commit precondition failed for {candidate}: {reason}")]
    Precondition {
        candidate: CandidateId,
        reason: Precondition,
    },

    #[error("candidate not found: {0}")]
    NotFound(CandidateId),

    #[error("commit would violate graph schema: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Rollback errors
#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("commit not found: {0}")]
    NotFound(CommitId),

    #[error("commit {0} is already rolled back")]
    AlreadyRolledBack(CommitId),

    #[error("commit {commit} is superseded by {by} on {entity}")]
    Superseded {
        commit: CommitId,
        by: CommitId,
        entity: EntityId,
    },

    #[error("entity {entity} has in-flight candidate {candidate}")]
    EntityInFlight {
        entity: EntityId,
        candidate: CandidateId,
    },

    #[error("snapshot for commit {0} has been evicted")]
    SnapshotEvicted(CommitId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Audit chain verification failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("audit chain broken at record {seq}")]
    IntegrityViolation { seq: u64 },
}
