//! ISG Core
//!
//! Data model shared by every ISG component.
//!
//! # Core Concepts
//!
//! - [`EntityId`]: structural path identifying an interface-level unit
//! - [`Entity`]: dual-state entity holding `current_code` and a staged [`FutureState`]
//! - [`Edge`]: typed relationship, current or owned by a candidate
//! - [`Candidate`]: content-addressed bundle of [`EntityMutation`]s
//! - [`ValidationResult`]: immutable record of one validation run
//! - [`ConfidenceReport`]: derived accept/reject assessment
//!
//! # Example
//!
//! ```rust,ignore
//! use isg_core::{Candidate, CandidateDraft, ChangeRequestId, EntityMutation};
//!
//! let spawn: EntityId = "rt::task::spawn".parse()?;
//! let draft = CandidateDraft::new(
//!     ChangeRequestId::new(),
//!     vec![EntityMutation::modify(spawn, new_body)],
//! );
//! let candidate = Candidate::from_draft(draft)?;
//! println!("candidate {}", candidate.id.short());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod batch;
mod candidate;
mod confidence;
mod edge;
mod entity;
mod hash;
mod id;
mod validation;

pub use batch::ExtractionBatch;
pub use candidate::{
    Candidate, CandidateDraft, CandidateId, ChangeRequestId, CommitId, EntityMutation,
    ProposedEdge, RunId,
};
pub use confidence::{Approval, ConfidenceReport, Gate, HumanDecision, RetrievalFeatures};
pub use edge::{Direction, Edge, EdgeKind};
pub use entity::{
    Entity, EntityKind, ExtractedEntity, FutureAction, FutureState, GenericParam, Param,
    Signature, SourceSpan,
};
pub use hash::{ContentHash, HashError};
pub use id::{EntityId, IdError, SEPARATOR};
pub use validation::{
    BuildOutcome, Diagnostic, FailureReason, Severity, TestOutcome, TestStatus,
    ValidationPhase, ValidationResult, Verdict,
};

/// Staging hooks reserved for the graph store.
/// **Note:** This is only for internal use and may change.
#[doc(hidden)]
pub mod __private {
    pub use super::entity::__private::{clear_future, stage_future};
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        Candidate, CandidateDraft, CandidateId, Direction, Edge, EdgeKind, Entity, EntityId,
        EntityKind, EntityMutation, ExtractedEntity, ExtractionBatch, FutureAction, Signature,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
