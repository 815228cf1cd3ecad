//! Projected future graph of one candidate
//!
//! A [`GraphView`] reads like the current graph with the candidate's
//! mutations applied: modified entities show their future code and
//! signature, created entities appear, deleted ones (and their edges)
//! vanish, and the candidate's proposed edges are added.

use crate::error::GraphError;
use crate::state::{CandidateRecord, GraphRead, GraphSnapshot};
use im::{OrdMap, OrdSet};
use isg_core::{
    Candidate, CandidateId, Direction, Edge, EdgeKind, Entity, EntityId, EntityKind,
    FutureAction, FutureState,
};

#[derive(Debug, Clone)]
pub struct GraphView {
    base: GraphSnapshot,
    candidate: Candidate,
    projected: OrdMap<EntityId, Entity>,
    deleted: OrdSet<EntityId>,
    extra_edges: Vec<Edge>,
}

impl GraphView {
    pub(crate) fn project(base: GraphSnapshot, id: &CandidateId) -> Result<Self, GraphError> {
        let record: &CandidateRecord = base
            .candidate(id)
            .filter(|r| r.is_pending())
            .ok_or(GraphError::CandidateNotPending(*id))?;
        let candidate = record.candidate.clone();

        let mut projected = OrdMap::new();
        let mut deleted = OrdSet::new();
        for m in &candidate.mutations {
            match m.action {
                FutureAction::Delete => {
                    deleted.insert(m.entity.clone());
                }
                FutureAction::Modify => {
                    if let Some(current) = base.entity(&m.entity) {
                        let mut entity = current.clone();
                        entity.current_code.clone_from(&m.code);
                        if let Some(sig) = &m.signature {
                            entity.signature = sig.clone();
                        }
                        projected.insert(m.entity.clone(), entity);
                    }
                }
                FutureAction::Create => {
                    let mut entity = Entity::new(
                        m.entity.clone(),
                        m.kind.unwrap_or(EntityKind::Function),
                    );
                    entity.current_code.clone_from(&m.code);
                    if let Some(sig) = &m.signature {
                        entity.signature = sig.clone();
                    }
                    isg_core::__private::stage_future(
                        &mut entity,
                        FutureState {
                            action: FutureAction::Create,
                            code: m.code.clone(),
                            signature: m.signature.clone(),
                            candidate: candidate.id,
                        },
                    );
                    projected.insert(m.entity.clone(), entity);
                }
            }
        }

        let extra_edges = base
            .state
            .candidate_edges
            .get(id)
            .map(|edges| edges.iter().cloned().collect())
            .unwrap_or_default();

        Ok(Self {
            base,
            candidate,
            projected,
            deleted,
            extra_edges,
        })
    }

    /// Candidate this view projects
    #[inline]
    #[must_use]
    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    /// Snapshot the view was projected from
    #[inline]
    #[must_use]
    pub fn base(&self) -> &GraphSnapshot {
        &self.base
    }

    #[inline]
    #[must_use]
    pub fn is_deleted(&self, id: &EntityId) -> bool {
        self.deleted.contains(id)
    }

    /// Ids of entities the candidate creates
    pub fn created(&self) -> impl Iterator<Item = &EntityId> {
        self.projected
            .values()
            .filter(|e| e.future_action() == Some(FutureAction::Create))
            .map(|e| &e.id)
    }

    fn visible(&self, edge: &Edge) -> bool {
        !self.deleted.contains(&edge.from) && !self.deleted.contains(&edge.to)
    }
}

impl GraphRead for GraphView {
    fn entity(&self, id: &EntityId) -> Option<&Entity> {
        if self.deleted.contains(id) {
            return None;
        }
        self.projected.get(id).or_else(|| self.base.entity(id))
    }

    fn edges(&self, id: &EntityId, direction: Direction, kinds: &[EdgeKind]) -> Vec<Edge> {
        if self.deleted.contains(id) {
            return Vec::new();
        }
        let mut edges: Vec<Edge> = self
            .base
            .edges(id, direction, kinds)
            .into_iter()
            .filter(|e| self.visible(e))
            .collect();
        edges.extend(
            self.extra_edges
                .iter()
                .filter(|e| kinds.is_empty() || kinds.contains(&e.kind))
                .filter(|e| {
                    (direction.includes_outgoing() && &e.from == id)
                        || (direction.includes_incoming() && &e.to == id)
                })
                .cloned(),
        );
        edges
    }

    fn entities(&self) -> Box<dyn Iterator<Item = &Entity> + '_> {
        let existing = self
            .base
            .entities()
            .filter(|e| !self.deleted.contains(&e.id))
            .map(|e| self.projected.get(&e.id).unwrap_or(e));
        let created = self
            .projected
            .values()
            .filter(|e| e.future_action() == Some(FutureAction::Create));
        Box::new(existing.chain(created))
    }

    fn entities_under(&self, prefix: &EntityId) -> Vec<&Entity> {
        let mut found: Vec<&Entity> = self
            .base
            .entities_under(prefix)
            .into_iter()
            .filter(|e| !self.deleted.contains(&e.id))
            .map(|e| self.projected.get(&e.id).unwrap_or(e))
            .collect();
        found.extend(
            self.projected
                .values()
                .filter(|e| e.future_action() == Some(FutureAction::Create))
                .filter(|e| prefix.is_prefix_of(&e.id)),
        );
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    fn entity_count(&self) -> usize {
        let created = self.created().count();
        self.base.entity_count() - self.deleted.len() + created
    }
}
