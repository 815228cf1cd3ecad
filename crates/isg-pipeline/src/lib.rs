//! ISG Pipeline
//!
//! Wires the graph store, retrieval, validation gate and commit manager
//! into one request flow, and adds the pieces only the flow needs:
//!
//! - [`ConfidenceScorer`]: calibrated accept/reject decision per validation run
//! - [`Proposer`]: the seam where drafts enter
//! - [`Pipeline`]: orchestration, human review and rollback
//! - [`PipelineConfig`]: one TOML document for every component
//!
//! # Example
//!
//! ```rust,ignore
//! use isg_pipeline::{ChangeRequest, Pipeline, PipelineConfig};
//!
//! let pipeline = Pipeline::new(PipelineConfig::load("isg.toml")?, proposer)?;
//! pipeline.ingest(batch)?;
//!
//! let spawn = "rt::task::spawn".parse()?;
//! let outcome = pipeline
//!     .handle(&ChangeRequest::new("require Send + 'static for spawned tasks", vec![spawn]))
//!     .await?;
//! if let Some(commit) = outcome.committed() {
//!     println!("committed {}", commit.commit);
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod confidence;
pub mod config;
mod error;
mod orchestrator;
mod proposer;
pub mod telemetry;

pub use confidence::{Calibration, ConfidenceConfig, ConfidenceScorer, FeatureWeights};
pub use config::{ConfigError, ContextConfig, PipelineConfig, StorageConfig};
pub use error::{ErrorKind, PipelineError};
pub use orchestrator::{CandidateOutcome, ChangeOutcome, ChangeRequest, Disposition, Pipeline};
pub use proposer::{Proposer, ProposerError, StaticProposer};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{ChangeRequest, ConfidenceScorer, Pipeline, PipelineConfig, Proposer};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
