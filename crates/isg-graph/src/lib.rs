//! ISG Graph
//!
//! Versioned storage for the interface graph and the three components that
//! write to it:
//!
//! - [`GraphStore`]: entity/edge persistence with snapshot-consistent reads
//!   and read-only future projections ([`GraphView`])
//! - [`CandidateStore`]: the only writer of entity future fields
//! - [`CommitManager`]: the only writer of `current_code`, with rollback
//!   snapshots and a hash-chained audit trail
//!
//! Write access is enforced by visibility: the store's transaction hook is
//! crate-private, so code outside this crate can only read.
//!
//! # Example
//!
//! ```rust,ignore
//! use isg_graph::{CandidateStore, CommitManager, GraphStore, ValidationLog};
//!
//! let store = Arc::new(GraphStore::new());
//! store.upsert_entities(batch)?;
//!
//! let candidates = CandidateStore::new(Arc::clone(&store), CandidatePolicy::default());
//! let id = candidates.submit(candidate)?;
//!
//! // ... validate and score ...
//! let commits = CommitManager::new(Arc::clone(&store), log);
//! let result = commits.commit(&id, &Approval::Confidence(report))?;
//! commits.rollback(&result.commit)?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod audit;
mod candidate;
mod commit;
mod error;
mod persist;
mod state;
mod store;
mod validation_log;
mod view;

pub use audit::{verify_chain, AuditAction, AuditRecord};
pub use candidate::{CandidatePolicy, CandidateStore};
pub use commit::{CommitManager, CommitResult, RollbackResult};
pub use error::{
    AuditError, CandidateError, CommitError, GraphError, PolicyViolation, Precondition,
    RollbackError, StorageError,
};
pub use persist::{SnapshotStorage, SNAPSHOT_FILE};
pub use state::{
    CandidateRecord, CandidateStatus, CommitRecord, CommitSnapshot, GraphRead, GraphSnapshot,
};
pub use store::{GraphStore, UpsertReport};
pub use validation_log::{ValidationLog, VALIDATION_LOG_FILE};
pub use view::GraphView;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        CandidatePolicy, CandidateStore, CommitManager, GraphRead, GraphSnapshot, GraphStore,
        GraphView, ValidationLog,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
