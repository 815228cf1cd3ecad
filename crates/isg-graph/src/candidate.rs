//! Candidate store
//!
//! The only write path into entity future fields. A submission is checked
//! against the schema policy and the one-in-flight-candidate rule, then
//! staged in a single store transaction.

use crate::error::{CandidateError, PolicyViolation};
use crate::state::{CandidateRecord, CandidateStatus, GraphState};
use crate::store::GraphStore;
use chrono::Utc;
use im::Vector;
use isg_core::{Candidate, CandidateId, Edge, EntityId, EntityMutation, FutureAction, FutureState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Schema limits applied to every submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidatePolicy {
    pub max_changed_entities: usize,
    pub max_diff_bytes: usize,
}

impl Default for CandidatePolicy {
    fn default() -> Self {
        Self {
            max_changed_entities: 32,
            max_diff_bytes: 256 * 1024,
        }
    }
}

impl CandidatePolicy {
    #[must_use]
    pub fn with_max_changed_entities(mut self, max: usize) -> Self {
        self.max_changed_entities = max;
        self
    }

    #[must_use]
    pub fn with_max_diff_bytes(mut self, max: usize) -> Self {
        self.max_diff_bytes = max;
        self
    }

    /// Shape checks that need no graph access
    ///
    /// # Errors
    /// Returns the first violated limit
    pub fn check(&self, candidate: &Candidate) -> Result<(), PolicyViolation> {
        let count = candidate.mutations.len();
        if count == 0 {
            return Err(PolicyViolation::Empty);
        }
        if count > self.max_changed_entities {
            return Err(PolicyViolation::TooManyEntities {
                count,
                max: self.max_changed_entities,
            });
        }
        let bytes = candidate.diff_bytes();
        if bytes > self.max_diff_bytes {
            return Err(PolicyViolation::DiffTooLarge {
                bytes,
                max: self.max_diff_bytes,
            });
        }
        let mut targets: Vec<&EntityId> = candidate.affected().collect();
        targets.sort();
        for pair in targets.windows(2) {
            if pair[0].overlaps(pair[1]) {
                return Err(PolicyViolation::OverlappingTargets {
                    first: pair[0].clone(),
                    second: pair[1].clone(),
                });
            }
        }
        Ok(())
    }
}

fn invalid(m: &EntityMutation, reason: &str) -> PolicyViolation {
    PolicyViolation::InvalidMutation {
        entity: m.entity.clone(),
        action: m.action,
        reason: reason.to_string(),
    }
}

fn check_mutation(state: &GraphState, m: &EntityMutation) -> Result<(), PolicyViolation> {
    let existing = state.entities.get(&m.entity);
    match m.action {
        FutureAction::Modify => {
            let entity = existing.ok_or_else(|| invalid(m, "entity does not exist"))?;
            if entity.current_code.is_none() {
                return Err(invalid(m, "entity has no body to modify"));
            }
            if m.code.is_none() {
                return Err(invalid(m, "modify requires new code"));
            }
        }
        FutureAction::Delete => {
            existing.ok_or_else(|| invalid(m, "entity does not exist"))?;
            if m.code.is_some() {
                return Err(invalid(m, "delete carries no code"));
            }
        }
        FutureAction::Create => {
            if existing.is_some() {
                return Err(invalid(m, "entity already exists"));
            }
            if m.kind.is_none() {
                return Err(invalid(m, "create requires a kind"));
            }
            if m.code.is_none() {
                return Err(invalid(m, "create requires code"));
            }
        }
    }
    Ok(())
}

/// Owner of candidate records and entity future fields
#[derive(Debug, Clone)]
pub struct CandidateStore {
    store: Arc<GraphStore>,
    policy: CandidatePolicy,
}

impl CandidateStore {
    #[must_use]
    pub fn new(store: Arc<GraphStore>, policy: CandidatePolicy) -> Self {
        Self { store, policy }
    }

    #[inline]
    #[must_use]
    pub fn policy(&self) -> &CandidatePolicy {
        &self.policy
    }

    /// Stage a candidate's future state
    ///
    /// Re-submitting an identical pending candidate returns its id without
    /// change. A target overlapping any in-flight entity is rejected, never
    /// queued.
    ///
    /// # Errors
    /// - [`CandidateError::Policy`] for schema violations
    /// - [`CandidateError::Conflict`] if a target is already in flight
    /// - [`CandidateError::Closed`] if this exact diff was already committed or discarded
    pub fn submit(&self, candidate: Candidate) -> Result<CandidateId, CandidateError> {
        self.policy.check(&candidate)?;
        let id = candidate.id;

        let fresh = self.store.transact(|state| {
            if let Some(record) = state.candidates.get(&id) {
                return if record.is_pending() {
                    Ok(false)
                } else {
                    Err(CandidateError::Closed(id))
                };
            }

            for m in &candidate.mutations {
                if let Some((held, holder)) = state.in_flight_overlap(&m.entity) {
                    return Err(CandidateError::Conflict {
                        entity: m.entity.clone(),
                        held,
                        holder,
                    });
                }
                check_mutation(state, m)?;
            }

            let deleted: Vec<&EntityId> = candidate
                .mutations
                .iter()
                .filter(|m| m.action == FutureAction::Delete)
                .map(|m| &m.entity)
                .collect();
            let resolves = |target: &EntityId| {
                (state.entities.contains_key(target) && !deleted.contains(&target))
                    || candidate
                        .mutation(target)
                        .is_some_and(|m| m.action == FutureAction::Create)
            };
            let mut edges = Vector::new();
            for proposed in &candidate.edges {
                if !resolves(&proposed.from) || !resolves(&proposed.to) {
                    return Err(PolicyViolation::DanglingProposedEdge {
                        from: proposed.from.clone(),
                        to: proposed.to.clone(),
                    }
                    .into());
                }
                edges.push_back(Edge::projected(
                    proposed.from.clone(),
                    proposed.to.clone(),
                    proposed.kind,
                    id,
                ));
            }

            for m in &candidate.mutations {
                if m.action != FutureAction::Create {
                    if let Some(entity) = state.entities.get_mut(&m.entity) {
                        isg_core::__private::stage_future(
                            entity,
                            FutureState {
                                action: m.action,
                                code: m.code.clone(),
                                signature: m.signature.clone(),
                                candidate: id,
                            },
                        );
                    }
                }
                state.in_flight.insert(m.entity.clone(), id);
            }
            if !edges.is_empty() {
                state.candidate_edges.insert(id, edges);
            }
            state.candidates.insert(
                id,
                CandidateRecord {
                    candidate: candidate.clone(),
                    status: CandidateStatus::Pending,
                    submitted_at: Utc::now(),
                    closed_at: None,
                },
            );
            Ok(true)
        })?;

        if fresh {
            tracing::info!(
                candidate = %id.short(),
                entities = candidate.mutations.len(),
                "candidate submitted"
            );
        } else {
            tracing::debug!(candidate = %id.short(), "identical candidate already pending");
        }
        Ok(id)
    }

    /// Candidate record by id
    ///
    /// # Errors
    /// Returns [`CandidateError::NotFound`] if unknown
    pub fn get_candidate(&self, id: &CandidateId) -> Result<CandidateRecord, CandidateError> {
        self.store
            .snapshot()
            .candidate(id)
            .cloned()
            .ok_or(CandidateError::NotFound(*id))
    }

    /// Drop a pending candidate and clear its staged future state
    ///
    /// # Errors
    /// - [`CandidateError::NotFound`] if unknown
    /// - [`CandidateError::Closed`] if already committed or discarded
    pub fn discard(&self, id: &CandidateId) -> Result<(), CandidateError> {
        self.store.transact(|state| {
            let mut record = state
                .candidates
                .get(id)
                .cloned()
                .ok_or(CandidateError::NotFound(*id))?;
            if !record.is_pending() {
                return Err(CandidateError::Closed(*id));
            }
            release(state, &record.candidate);
            record.status = CandidateStatus::Discarded;
            record.closed_at = Some(Utc::now());
            state.candidates.insert(*id, record);
            Ok(())
        })?;
        tracing::info!(candidate = %id.short(), "candidate discarded");
        Ok(())
    }

    /// Every pending candidate
    #[must_use]
    pub fn list_pending(&self) -> Vec<CandidateRecord> {
        self.store
            .snapshot()
            .candidates()
            .filter(|r| r.is_pending())
            .cloned()
            .collect()
    }
}

/// Clear staged future fields and in-flight locks held by `candidate`
pub(crate) fn release(state: &mut GraphState, candidate: &Candidate) {
    for target in candidate.affected() {
        if state.in_flight.get(target) == Some(&candidate.id) {
            state.in_flight.remove(target);
        }
        if let Some(entity) = state.entities.get_mut(target) {
            if entity.candidate_id() == Some(&candidate.id) {
                isg_core::__private::clear_future(entity);
            }
        }
    }
    state.candidate_edges.remove(&candidate.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use isg_core::{CandidateDraft, ChangeRequestId, EdgeKind, EntityKind, ExtractedEntity, ExtractionBatch};

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    fn setup() -> (Arc<GraphStore>, CandidateStore) {
        let store = Arc::new(GraphStore::new());
        let mut batch = ExtractionBatch::new();
        for s in ["rt::task::spawn", "rt::task::yield_now", "rt::net::serve"] {
            batch = batch.with_entity(ExtractedEntity::new(id(s), EntityKind::Function, "fn x() {}"));
        }
        store.upsert_entities(batch).unwrap();
        let candidates = CandidateStore::new(Arc::clone(&store), CandidatePolicy::default());
        (store, candidates)
    }

    fn candidate(mutations: Vec<EntityMutation>) -> Candidate {
        Candidate::from_draft(CandidateDraft::new(ChangeRequestId::new(), mutations)).unwrap()
    }

    #[test]
    fn submit_stages_future_fields() {
        let (store, candidates) = setup();
        let c = candidate(vec![EntityMutation::modify(id("rt::task::spawn"), "fn spawn() {}")]);
        let cid = candidates.submit(c).unwrap();

        let spawn = store.get_entity(&id("rt::task::spawn")).unwrap();
        assert_eq!(spawn.future_code(), Some("fn spawn() {}"));
        assert_eq!(spawn.candidate_id(), Some(&cid));
        assert_eq!(spawn.current_code.as_deref(), Some("fn x() {}"));
        assert_eq!(candidates.list_pending().len(), 1);
    }

    #[test]
    fn second_candidate_on_entity_is_rejected() {
        let (_, candidates) = setup();
        candidates
            .submit(candidate(vec![EntityMutation::modify(id("rt::task::spawn"), "a")]))
            .unwrap();
        let err = candidates
            .submit(candidate(vec![EntityMutation::modify(id("rt::task::spawn"), "b")]))
            .unwrap_err();
        assert!(matches!(err, CandidateError::Conflict { .. }));
    }

    #[test]
    fn enclosing_module_conflicts_with_member() {
        let (store, candidates) = setup();
        store
            .upsert_entities(ExtractionBatch::new().with_entity(ExtractedEntity::new(
                id("rt::task"),
                EntityKind::Module,
                "mod task {}",
            )))
            .unwrap();
        candidates
            .submit(candidate(vec![EntityMutation::modify(id("rt::task::spawn"), "a")]))
            .unwrap();
        let err = candidates
            .submit(candidate(vec![EntityMutation::modify(id("rt::task"), "mod task {}\n")]))
            .unwrap_err();
        match err {
            CandidateError::Conflict { held, .. } => assert_eq!(held, id("rt::task::spawn")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn identical_resubmission_is_idempotent() {
        let (store, candidates) = setup();
        let muts = vec![EntityMutation::modify(id("rt::task::spawn"), "a")];
        let first = candidates.submit(candidate(muts.clone())).unwrap();
        let second = candidates.submit(candidate(muts)).unwrap();
        assert_eq!(first, second);
        assert_eq!(candidates.list_pending().len(), 1);
        assert_eq!(store.snapshot().in_flight(&id("rt::task::spawn")), Some(first));
    }

    #[test]
    fn discard_clears_future_and_lock() {
        let (store, candidates) = setup();
        let cid = candidates
            .submit(candidate(vec![EntityMutation::delete(id("rt::net::serve"))]))
            .unwrap();
        candidates.discard(&cid).unwrap();
        let serve = store.get_entity(&id("rt::net::serve")).unwrap();
        assert!(serve.future().is_none());
        assert_eq!(store.snapshot().in_flight(&id("rt::net::serve")), None);
        assert_eq!(
            candidates.get_candidate(&cid).unwrap().status,
            CandidateStatus::Discarded
        );
        assert!(matches!(candidates.discard(&cid), Err(CandidateError::Closed(_))));
    }

    #[test]
    fn policy_limits_are_enforced() {
        let store = Arc::new(GraphStore::new());
        let candidates = CandidateStore::new(
            store,
            CandidatePolicy::default()
                .with_max_changed_entities(1)
                .with_max_diff_bytes(4),
        );
        let err = candidates
            .submit(candidate(vec![
                EntityMutation::delete(id("a::f")),
                EntityMutation::delete(id("a::g")),
            ]))
            .unwrap_err();
        assert!(matches!(
            err,
            CandidateError::Policy(PolicyViolation::TooManyEntities { count: 2, max: 1 })
        ));
        let err = candidates
            .submit(candidate(vec![EntityMutation::modify(id("a::f"), "12345")]))
            .unwrap_err();
        assert!(matches!(
            err,
            CandidateError::Policy(PolicyViolation::DiffTooLarge { bytes: 5, max: 4 })
        ));
        assert!(matches!(
            candidates.submit(candidate(vec![])),
            Err(CandidateError::Policy(PolicyViolation::Empty))
        ));
    }

    #[test]
    fn invalid_actions_are_rejected() {
        let (_, candidates) = setup();
        let err = candidates
            .submit(candidate(vec![EntityMutation::modify(id("rt::missing"), "x")]))
            .unwrap_err();
        assert!(matches!(
            err,
            CandidateError::Policy(PolicyViolation::InvalidMutation { .. })
        ));
        let err = candidates
            .submit(candidate(vec![EntityMutation::create(
                id("rt::task::spawn"),
                EntityKind::Function,
                "x",
            )]))
            .unwrap_err();
        assert!(matches!(
            err,
            CandidateError::Policy(PolicyViolation::InvalidMutation { .. })
        ));
    }

    #[test]
    fn proposed_edges_must_resolve() {
        let (_, candidates) = setup();
        let c = Candidate::from_draft(
            CandidateDraft::new(
                ChangeRequestId::new(),
                vec![EntityMutation::create(id("rt::task::spawn_local"), EntityKind::Function, "fn spawn_local() {}")],
            )
            .with_edge(id("rt::task::spawn_local"), id("rt::task::gone"), EdgeKind::Calls),
        )
        .unwrap();
        assert!(matches!(
            candidates.submit(c),
            Err(CandidateError::Policy(PolicyViolation::DanglingProposedEdge { .. }))
        ));
    }
}
