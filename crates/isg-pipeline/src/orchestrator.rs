//! Change-request pipeline
//!
//! One request flows through every component in order:
//!
//! 1. retrieve a ranked neighbourhood around the seeds
//! 2. pack it into a context bundle under the budget
//! 3. ask the [`Proposer`] for drafts
//! 4. stage each draft as a candidate and validate it
//! 5. score the run and act on the gate: commit, park for review, or discard
//!
//! Nothing reaches `current_code` except through [`CommitManager::commit`],
//! and that only after a passing run is on record.

use crate::config::PipelineConfig;
use crate::confidence::ConfidenceScorer;
use crate::error::{ErrorKind, PipelineError};
use crate::proposer::Proposer;
use dashmap::DashMap;
use isg_core::{
    Approval, Candidate, CandidateId, ChangeRequestId, CommitId, ConfidenceReport, EntityId,
    ExtractionBatch, FailureReason, FutureAction, Gate, HumanDecision, RetrievalFeatures,
    ValidationResult, Verdict,
};
use isg_graph::{
    AuditRecord, CandidateError, CandidateRecord, CandidateStore, CommitManager, CommitResult,
    GraphStore, RollbackResult, UpsertReport, ValidationLog,
};
use isg_retrieval::{
    ContextAssembler, ContextBundle, ContextRequest, RankedList, RetrievalEngine, RetrievalFilters,
    RetrievalRequest, VectorIndex,
};
use isg_validation::{BuildTool, SessionFactory, ValidationGate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A request to change the code around some seed entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    #[serde(default)]
    pub id: ChangeRequestId,
    /// What the change should achieve, passed to the proposer as the focus
    pub intent: String,
    pub seeds: Vec<EntityId>,
    #[serde(default)]
    pub max_hops: Option<u32>,
    #[serde(default)]
    pub k_vector: Option<usize>,
    #[serde(default)]
    pub filters: RetrievalFilters,
    /// Context budget, the configured default when unset
    #[serde(default)]
    pub budget: Option<usize>,
}

impl ChangeRequest {
    #[must_use]
    pub fn new(intent: impl Into<String>, seeds: Vec<EntityId>) -> Self {
        Self {
            id: ChangeRequestId::new(),
            intent: intent.into(),
            seeds,
            max_hops: None,
            k_vector: None,
            filters: RetrievalFilters::default(),
            budget: None,
        }
    }

    #[must_use]
    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = Some(budget);
        self
    }

    #[must_use]
    pub fn with_max_hops(mut self, hops: u32) -> Self {
        self.max_hops = Some(hops);
        self
    }
}

/// What happened to one candidate
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Committed(CommitResult),
    /// Parked until [`Pipeline::approve`] is called
    AwaitingReview,
    /// Discarded; the reason is for humans
    Rejected(String),
    /// Never staged because its targets were already in flight
    Conflicted(String),
}

#[derive(Debug, Clone)]
pub struct CandidateOutcome {
    pub candidate: CandidateId,
    pub validation: Option<Arc<ValidationResult>>,
    pub report: Option<ConfidenceReport>,
    pub disposition: Disposition,
}

impl CandidateOutcome {
    /// Error classification of a candidate that did not make it
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        if let Disposition::Conflicted(_) = self.disposition {
            return Some(ErrorKind::CandidateConflict);
        }
        match self.validation.as_ref().map(|v| v.verdict) {
            Some(Verdict::Failed(FailureReason::Timeout)) => Some(ErrorKind::ValidationTimeout),
            Some(Verdict::Failed(_)) => Some(ErrorKind::ValidationFailed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self.disposition, Disposition::Committed(_))
    }
}

#[derive(Debug, Clone)]
pub struct ChangeOutcome {
    pub request: ChangeRequestId,
    pub ranked: RankedList,
    pub bundle: ContextBundle,
    pub candidates: Vec<CandidateOutcome>,
}

impl ChangeOutcome {
    /// The commit this request produced, if any
    #[must_use]
    pub fn committed(&self) -> Option<&CommitResult> {
        self.candidates.iter().find_map(|c| match &c.disposition {
            Disposition::Committed(result) => Some(result),
            _ => None,
        })
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<GraphStore>,
    log: Arc<ValidationLog>,
    retrieval: RetrievalEngine,
    assembler: ContextAssembler,
    candidates: CandidateStore,
    gate: ValidationGate,
    scorer: ConfidenceScorer,
    commits: CommitManager,
    proposer: Arc<dyn Proposer>,
    reviews: DashMap<CandidateId, ConfidenceReport>,
}

impl Pipeline {
    /// Pipeline over the configured storage, in memory when no directory is set
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or stored state cannot be loaded
    pub fn new(config: PipelineConfig, proposer: Arc<dyn Proposer>) -> Result<Self, PipelineError> {
        config.validate()?;
        let store = match config.storage.snapshots() {
            Some(storage) => GraphStore::open(storage)?,
            None => GraphStore::new(),
        };
        let log = match config.storage.validation_log() {
            Some(path) => ValidationLog::open(path)?,
            None => ValidationLog::in_memory(),
        };
        Ok(Self::wire(config, Arc::new(store), Arc::new(log), proposer))
    }

    /// Pipeline over an existing store and log
    #[must_use]
    pub fn with_store(
        config: PipelineConfig,
        store: Arc<GraphStore>,
        log: Arc<ValidationLog>,
        proposer: Arc<dyn Proposer>,
    ) -> Self {
        Self::wire(config, store, log, proposer)
    }

    fn wire(
        config: PipelineConfig,
        store: Arc<GraphStore>,
        log: Arc<ValidationLog>,
        proposer: Arc<dyn Proposer>,
    ) -> Self {
        let retrieval = RetrievalEngine::new(config.retrieval.clone());
        let assembler = ContextAssembler::new(config.context.size.into());
        let candidates = CandidateStore::new(Arc::clone(&store), config.candidates);
        let gate = ValidationGate::new(config.gate.clone(), Arc::clone(&store), Arc::clone(&log));
        let scorer = ConfidenceScorer::new(config.confidence.clone());
        let commits = CommitManager::new(Arc::clone(&store), Arc::clone(&log))
            .with_retain_limit(config.storage.retain_snapshots);
        Self {
            config,
            store,
            log,
            retrieval,
            assembler,
            candidates,
            gate,
            scorer,
            commits,
            proposer,
            reviews: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_build_tool(mut self, tool: Arc<dyn BuildTool>) -> Self {
        self.gate = self.gate.with_tool(tool);
        self
    }

    #[must_use]
    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.gate = self.gate.with_session_factory(factory);
        self
    }

    #[must_use]
    pub fn with_vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.retrieval = self.retrieval.with_index(index);
        self
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    #[must_use]
    pub fn validation_log(&self) -> &Arc<ValidationLog> {
        &self.log
    }

    #[must_use]
    pub fn candidates(&self) -> &CandidateStore {
        &self.candidates
    }

    #[must_use]
    pub fn gate(&self) -> &ValidationGate {
        &self.gate
    }

    /// Load an extraction batch into the graph
    ///
    /// # Errors
    /// Returns error on schema conflicts, locked entities, or storage failure
    pub fn ingest(&self, batch: ExtractionBatch) -> Result<UpsertReport, PipelineError> {
        Ok(self.store.upsert_entities(batch)?)
    }

    /// Ranked neighbourhood of the request's seeds over the current graph
    ///
    /// # Errors
    /// Returns error if no seed is usable
    pub fn retrieve(&self, request: &ChangeRequest) -> Result<RankedList, PipelineError> {
        let config = self.retrieval.config();
        let retrieval = RetrievalRequest::new(
            request.seeds.clone(),
            request.max_hops.unwrap_or(config.default_max_hops),
            request.k_vector.unwrap_or(config.default_k_vector),
        )
        .with_filters(request.filters.clone());
        let snapshot = self.store.snapshot();
        Ok(self.retrieval.retrieve(&snapshot, &retrieval)?)
    }

    /// Pack a ranked list under the request's budget, focused on its intent
    #[must_use]
    pub fn assemble(&self, request: &ChangeRequest, ranked: &RankedList) -> ContextBundle {
        let budget = request.budget.unwrap_or(self.config.context.budget);
        let mut context = ContextRequest::new(budget);
        if !request.intent.trim().is_empty() {
            context = context.with_focus(request.intent.clone());
        }
        self.assembler.pack(ranked, &context)
    }

    /// Run one change request end to end
    ///
    /// Drafts are tried in order. The first one committed ends the request;
    /// any later drafts are skipped since they were written against the
    /// code that commit replaced.
    ///
    /// # Errors
    /// Returns error when retrieval or the proposer fails, or when a
    /// component reports an infrastructure failure. Candidate-level
    /// outcomes (conflict, failed validation, low confidence) are reported
    /// in the returned [`ChangeOutcome`] instead.
    #[tracing::instrument(skip_all, fields(request = %request.id))]
    pub async fn handle(&self, request: &ChangeRequest) -> Result<ChangeOutcome, PipelineError> {
        let ranked = self.retrieve(request)?;
        let bundle = self.assemble(request, &ranked);
        info!(
            ranked = ranked.len(),
            packed = bundle.items.len(),
            used = bundle.used,
            degraded = ranked.is_degraded(),
            "context assembled"
        );

        let drafts = self.proposer.propose(request, &bundle).await?;
        let total = drafts.len();
        let mut outcomes = Vec::with_capacity(total);
        for mut draft in drafts {
            draft.change_request = request.id;
            let candidate = Candidate::from_draft(draft).map_err(CandidateError::from)?;
            let outcome = self.try_candidate(candidate, &ranked, &bundle).await?;
            let done = outcome.is_committed();
            outcomes.push(outcome);
            if done {
                break;
            }
        }
        if outcomes.len() < total {
            debug!(skipped = total - outcomes.len(), "drafts skipped after commit");
        }

        Ok(ChangeOutcome {
            request: request.id,
            ranked,
            bundle,
            candidates: outcomes,
        })
    }

    async fn try_candidate(
        &self,
        candidate: Candidate,
        ranked: &RankedList,
        bundle: &ContextBundle,
    ) -> Result<CandidateOutcome, PipelineError> {
        let features = features(&candidate, ranked, bundle);
        let staged = candidate.id;
        let refused = |disposition| CandidateOutcome {
            candidate: staged,
            validation: None,
            report: None,
            disposition,
        };
        let id = match self.candidates.submit(candidate) {
            Ok(id) => id,
            Err(e @ (CandidateError::Conflict { .. } | CandidateError::Closed(_))) => {
                warn!(candidate = %staged.short(), error = %e, "candidate not staged");
                return Ok(refused(Disposition::Conflicted(e.to_string())));
            }
            Err(CandidateError::Policy(violation)) => {
                warn!(candidate = %staged.short(), error = %violation, "candidate refused");
                return Ok(refused(Disposition::Rejected(violation.to_string())));
            }
            Err(e) => return Err(e.into()),
        };

        let validation = self.gate.validate(&id).await?;
        let report = self.scorer.score(&validation, features);
        let disposition = match report.gate {
            Gate::AutoApply => {
                let result = self.commits.commit(&id, &Approval::Confidence(report.clone()))?;
                Disposition::Committed(result)
            }
            Gate::HumanReview => {
                self.reviews.insert(id, report.clone());
                info!(candidate = %id.short(), probability = report.probability, "candidate awaiting review");
                Disposition::AwaitingReview
            }
            Gate::Reject => {
                self.candidates.discard(&id)?;
                let reason = match validation.verdict {
                    Verdict::Failed(why) => format!("validation failed: {why:?}"),
                    Verdict::Passed => format!("confidence {:.3} below threshold", report.probability),
                };
                info!(candidate = %id.short(), %reason, "candidate rejected");
                Disposition::Rejected(reason)
            }
        };

        Ok(CandidateOutcome {
            candidate: id,
            validation: Some(validation),
            report: Some(report),
            disposition,
        })
    }

    /// Reports of candidates waiting on a reviewer
    #[must_use]
    pub fn pending_reviews(&self) -> Vec<ConfidenceReport> {
        let mut reports: Vec<ConfidenceReport> = self.reviews.iter().map(|r| r.value().clone()).collect();
        reports.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        reports
    }

    /// Apply a reviewer's decision to a pending candidate
    ///
    /// Approval commits under the reviewer's authority, which still requires
    /// a passing run on record. Rejection discards the candidate.
    ///
    /// # Errors
    /// - [`PipelineError::UnknownReview`] if the candidate is not pending
    /// - [`PipelineError::Commit`] if a commit precondition fails
    pub fn approve(&self, candidate: &CandidateId, decision: HumanDecision) -> Result<Disposition, PipelineError> {
        // The parked report stays until the decision takes effect
        if !self.reviews.contains_key(candidate) {
            let pending = self.candidates.get_candidate(candidate).is_ok_and(|r| r.is_pending());
            if !pending {
                return Err(PipelineError::UnknownReview(*candidate));
            }
        }

        if !decision.approved {
            self.candidates.discard(candidate)?;
            self.reviews.remove(candidate);
            let reason = format!(
                "rejected by {}{}",
                decision.reviewer,
                decision.note.as_deref().map(|n| format!(": {n}")).unwrap_or_default()
            );
            info!(candidate = %candidate.short(), %reason, "candidate rejected on review");
            return Ok(Disposition::Rejected(reason));
        }
        let result = self.commits.commit(candidate, &Approval::Human(decision))?;
        self.reviews.remove(candidate);
        Ok(Disposition::Committed(result))
    }

    /// Validate a pending candidate outside a request, e.g. after a flaky run
    ///
    /// # Errors
    /// Returns error if the candidate is not pending or the run cannot be recorded
    pub async fn revalidate(&self, candidate: &CandidateId) -> Result<Arc<ValidationResult>, PipelineError> {
        Ok(self.gate.validate(candidate).await?)
    }

    /// Undo a commit
    ///
    /// # Errors
    /// Returns error if the commit is unknown, superseded, or blocked by an in-flight candidate
    pub fn rollback(&self, commit: &CommitId) -> Result<RollbackResult, PipelineError> {
        Ok(self.commits.rollback(commit)?)
    }

    #[must_use]
    pub fn list_pending(&self) -> Vec<CandidateRecord> {
        self.candidates.list_pending()
    }

    #[must_use]
    pub fn history(&self) -> Vec<AuditRecord> {
        self.commits.history()
    }

    /// Check the audit chain end to end
    ///
    /// # Errors
    /// Returns error naming the first broken record
    pub fn verify_audit(&self) -> Result<(), PipelineError> {
        Ok(self.commits.verify_audit()?)
    }
}

/// Retrieval-quality features for one candidate
fn features(candidate: &Candidate, ranked: &RankedList, bundle: &ContextBundle) -> RetrievalFeatures {
    let shown = |id: &EntityId| bundle.contains(id);
    let touched = candidate.mutations.len();
    let covered = candidate
        .mutations
        .iter()
        .filter(|m| match m.action {
            // a new entity cannot have been shown; its parent can
            FutureAction::Create => m.entity.parent().is_some_and(|p| shown(&p)),
            FutureAction::Modify | FutureAction::Delete => shown(&m.entity),
        })
        .count();
    #[allow(clippy::cast_precision_loss)]
    let consistency = if touched == 0 { 0.0 } else { covered as f64 / touched as f64 };
    RetrievalFeatures {
        coverage: bundle.coverage(&ranked.required()),
        agreement: ranked.agreement(),
        consistency,
    }
}
