//! Commit/rollback manager
//!
//! The only component that mutates `current_code`. A commit promotes every
//! staged future of one candidate in a single store transaction, keeps a
//! snapshot of what it replaced, and appends a hash-chained audit record.

use crate::audit::{self, AuditAction, AuditEntry, AuditRecord};
use crate::candidate::release;
use crate::error::{AuditError, CommitError, Precondition, RollbackError};
use crate::state::{CandidateStatus, CommitRecord, CommitSnapshot, GraphState};
use crate::store::GraphStore;
use crate::validation_log::ValidationLog;
use chrono::{DateTime, Utc};
use isg_core::{
    Approval, Candidate, CandidateId, CommitId, Edge, Entity, EntityId, EntityKind, FutureAction,
    Gate,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Outcome of a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub commit: CommitId,
    pub candidate: CandidateId,
    pub entities: Vec<EntityId>,
    pub committed_at: DateTime<Utc>,
    /// Sequence number of the audit record
    pub audit_seq: u64,
}

/// Outcome of a successful rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackResult {
    pub commit: CommitId,
    pub restored: Vec<EntityId>,
    pub audit_seq: u64,
}

#[derive(Debug, Clone)]
pub struct CommitManager {
    store: Arc<GraphStore>,
    validations: Arc<ValidationLog>,
    retain: usize,
}

impl CommitManager {
    #[must_use]
    pub fn new(store: Arc<GraphStore>, validations: Arc<ValidationLog>) -> Self {
        Self {
            store,
            validations,
            retain: 64,
        }
    }

    /// Number of rollback snapshots kept beyond which superseded ones are dropped
    #[must_use]
    pub fn with_retain_limit(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }

    fn check_preconditions(&self, id: &CandidateId, approval: &Approval) -> Result<(), Precondition> {
        let latest = self
            .validations
            .latest(id)
            .ok_or(Precondition::NotValidated)?;
        if !latest.is_passed() {
            return Err(Precondition::NotPassed);
        }
        match approval {
            Approval::Confidence(report) => {
                if report.candidate != *id {
                    return Err(Precondition::ForeignReport);
                }
                if report.run != latest.run {
                    return Err(Precondition::StaleReport {
                        report: report.run.to_string(),
                        latest: latest.run.to_string(),
                    });
                }
                if report.gate != Gate::AutoApply {
                    return Err(Precondition::GateNotAutoApply(report.gate));
                }
            }
            Approval::Human(decision) => {
                if !decision.approved {
                    return Err(Precondition::HumanRejected(decision.reviewer.clone()));
                }
            }
        }
        Ok(())
    }

    /// Promote a validated candidate's future state to current
    ///
    /// Requires the latest validation run to have passed, and either an
    /// auto-apply confidence report for that run or an explicit human approval.
    ///
    /// # Errors
    /// - [`CommitError::Precondition`] if any requirement is unmet
    /// - [`CommitError::NotFound`] if the candidate is unknown
    pub fn commit(&self, id: &CandidateId, approval: &Approval) -> Result<CommitResult, CommitError> {
        let precondition = |reason| CommitError::Precondition {
            candidate: *id,
            reason,
        };
        self.check_preconditions(id, approval).map_err(precondition)?;

        let retain = self.retain;
        let result = self.store.transact(|state| {
            let record = state
                .candidates
                .get(id)
                .cloned()
                .ok_or(CommitError::NotFound(*id))?;
            if !record.is_pending() {
                return Err(precondition(Precondition::NotPending));
            }
            let candidate = &record.candidate;
            let commit_id = CommitId::new();
            let snapshot = apply(state, candidate);
            release(state, candidate);

            state.commit_seq += 1;
            let committed_at = Utc::now();
            let entities: Vec<EntityId> = candidate.affected().cloned().collect();
            state.commits.insert(
                commit_id,
                CommitRecord {
                    id: commit_id,
                    seq: state.commit_seq,
                    candidate: *id,
                    change_request: candidate.change_request,
                    entities: entities.clone(),
                    approval: approval.describe(),
                    committed_at,
                    rolled_back_at: None,
                    snapshot: Some(snapshot),
                },
            );

            let mut closed = record.clone();
            closed.status = CandidateStatus::Committed(commit_id);
            closed.closed_at = Some(committed_at);
            state.candidates.insert(*id, closed);

            let audit_seq = audit::append(
                &mut state.audit,
                AuditEntry {
                    action: AuditAction::Commit,
                    commit: commit_id,
                    candidate: *id,
                    entities: entities.clone(),
                    detail: approval.describe(),
                },
            );
            evict_snapshots(state, retain);

            Ok(CommitResult {
                commit: commit_id,
                candidate: *id,
                entities,
                committed_at,
                audit_seq,
            })
        })?;

        tracing::info!(
            commit = %result.commit,
            candidate = %id.short(),
            entities = result.entities.len(),
            "candidate committed"
        );
        Ok(result)
    }

    /// Restore the committed state that `commit` replaced
    ///
    /// # Errors
    /// - [`RollbackError::Superseded`] if a later live commit touched the same entities
    /// - [`RollbackError::EntityInFlight`] if a touched entity has a pending candidate
    /// - [`RollbackError::AlreadyRolledBack`] / [`RollbackError::SnapshotEvicted`]
    pub fn rollback(&self, commit: &CommitId) -> Result<RollbackResult, RollbackError> {
        let result = self.store.transact(|state| {
            let record = state
                .commits
                .get(commit)
                .cloned()
                .ok_or(RollbackError::NotFound(*commit))?;
            if record.is_rolled_back() {
                return Err(RollbackError::AlreadyRolledBack(*commit));
            }
            let touched: BTreeSet<&EntityId> = record.entities.iter().collect();
            let superseding = state
                .commits
                .values()
                .filter(|c| c.seq > record.seq && !c.is_rolled_back())
                .find_map(|c| {
                    c.entities
                        .iter()
                        .find(|e| touched.iter().any(|t| t.overlaps(e)))
                        .map(|e| (c.id, e.clone()))
                });
            if let Some((by, entity)) = superseding {
                return Err(RollbackError::Superseded {
                    commit: *commit,
                    by,
                    entity,
                });
            }
            for entity in &record.entities {
                if let Some((_, candidate)) = state.in_flight_overlap(entity) {
                    return Err(RollbackError::EntityInFlight {
                        entity: entity.clone(),
                        candidate,
                    });
                }
            }
            let snapshot = record
                .snapshot
                .clone()
                .ok_or(RollbackError::SnapshotEvicted(*commit))?;

            restore(state, &snapshot);

            let mut closed = record.clone();
            closed.rolled_back_at = Some(Utc::now());
            state.commits.insert(*commit, closed);

            let audit_seq = audit::append(
                &mut state.audit,
                AuditEntry {
                    action: AuditAction::Rollback,
                    commit: *commit,
                    candidate: record.candidate,
                    entities: record.entities.clone(),
                    detail: format!("rollback of commit seq {}", record.seq),
                },
            );
            Ok(RollbackResult {
                commit: *commit,
                restored: record.entities,
                audit_seq,
            })
        })?;

        tracing::info!(commit = %commit, entities = result.restored.len(), "commit rolled back");
        Ok(result)
    }

    /// Audit trail, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<AuditRecord> {
        self.store.snapshot().audit().cloned().collect()
    }

    /// Verify the audit hash chain
    ///
    /// # Errors
    /// Returns the first record that fails verification
    pub fn verify_audit(&self) -> Result<(), AuditError> {
        audit::verify_chain(self.store.snapshot().audit())
    }
}

/// Apply a candidate to `state`, returning what it replaced
fn apply(state: &mut GraphState, candidate: &Candidate) -> CommitSnapshot {
    let mut prior = Vec::with_capacity(candidate.mutations.len());
    let mut prior_edges = BTreeSet::new();

    for m in &candidate.mutations {
        let before = state.entities.get(&m.entity).cloned().map(|mut e| {
            isg_core::__private::clear_future(&mut e);
            e
        });
        prior_edges.extend(state.incident_edges(&m.entity));

        match m.action {
            FutureAction::Modify => {
                if let Some(entity) = state.entities.get_mut(&m.entity) {
                    entity.current_code.clone_from(&m.code);
                    if let Some(sig) = &m.signature {
                        entity.signature = sig.clone();
                    }
                }
            }
            FutureAction::Delete => {
                state.entities.remove(&m.entity);
                state.remove_incident(&m.entity);
            }
            FutureAction::Create => {
                let mut entity = Entity::new(m.entity.clone(), m.kind.unwrap_or(EntityKind::Function));
                entity.current_code.clone_from(&m.code);
                if let Some(sig) = &m.signature {
                    entity.signature = sig.clone();
                }
                state.entities.insert(m.entity.clone(), entity);
            }
        }
        prior.push((m.entity.clone(), before));
    }

    let promoted_edges: Vec<Edge> = state
        .candidate_edges
        .get(&candidate.id)
        .map(|edges| edges.iter().map(Edge::promoted).collect())
        .unwrap_or_default();
    for edge in &promoted_edges {
        state.add_edge(edge.clone());
    }

    CommitSnapshot {
        prior,
        prior_edges: prior_edges.into_iter().collect(),
        promoted_edges,
    }
}

/// Undo [`apply`]
fn restore(state: &mut GraphState, snapshot: &CommitSnapshot) {
    for edge in &snapshot.promoted_edges {
        state.remove_edge(edge);
    }
    for (id, before) in &snapshot.prior {
        state.remove_incident(id);
        match before {
            Some(entity) => {
                state.entities.insert(id.clone(), entity.clone());
            }
            None => {
                state.entities.remove(id);
            }
        }
    }
    for edge in &snapshot.prior_edges {
        if state.entities.contains_key(&edge.from) && state.entities.contains_key(&edge.to) {
            state.add_edge(edge.clone());
        }
    }
}

/// Drop snapshots beyond `retain`, oldest first, but only for commits whose
/// entities have all been re-committed since
fn evict_snapshots(state: &mut GraphState, retain: usize) {
    let mut live: Vec<(u64, CommitId)> = state
        .commits
        .values()
        .filter(|c| c.snapshot.is_some())
        .map(|c| (c.seq, c.id))
        .collect();
    if live.len() <= retain {
        return;
    }
    live.sort_unstable();
    let mut excess = live.len() - retain;
    for (seq, id) in live {
        if excess == 0 {
            break;
        }
        let Some(record) = state.commits.get(&id) else {
            continue;
        };
        let superseded = record.entities.iter().all(|e| {
            state
                .commits
                .values()
                .any(|c| c.seq > seq && c.entities.iter().any(|x| x.overlaps(e)))
        });
        if superseded {
            let mut record = record.clone();
            record.snapshot = None;
            state.commits.insert(id, record);
            excess -= 1;
        }
    }
}
