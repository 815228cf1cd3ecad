//! Proposal seam
//!
//! The pipeline never generates code itself. A [`Proposer`] turns a
//! change request plus its assembled context into candidate drafts; what
//! sits behind it (a model, a codemod, a human) is not our concern.

use crate::orchestrator::ChangeRequest;
use async_trait::async_trait;
use isg_core::CandidateDraft;
use isg_retrieval::ContextBundle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposerError {
    /// Backend could not be reached; the request may be retried
    #[error("proposer unavailable: {0}")]
    Unavailable(String),

    /// Backend answered with something that is not a usable draft
    #[error("proposer returned a malformed draft: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Proposer: Send + Sync {
    /// Drafts for one request, best first. An empty list is a valid answer.
    async fn propose(
        &self,
        request: &ChangeRequest,
        context: &ContextBundle,
    ) -> Result<Vec<CandidateDraft>, ProposerError>;
}

/// Proposer that answers every request with the same drafts
///
/// Used when drafts come from outside the process, such as a JSON file
/// handed to the CLI.
#[derive(Debug, Clone, Default)]
pub struct StaticProposer {
    drafts: Vec<CandidateDraft>,
}

impl StaticProposer {
    #[must_use]
    pub fn new(drafts: Vec<CandidateDraft>) -> Self {
        Self { drafts }
    }
}

#[async_trait]
impl Proposer for StaticProposer {
    async fn propose(
        &self,
        _request: &ChangeRequest,
        _context: &ContextBundle,
    ) -> Result<Vec<CandidateDraft>, ProposerError> {
        Ok(self.drafts.clone())
    }
}
