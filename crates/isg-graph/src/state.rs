//! Graph state and read access
//!
//! [`GraphState`] is built entirely from persistent `im` collections, so
//! cloning it is O(1) and a writer can prepare the next state while
//! readers keep using the previous one untouched.

use crate::audit::AuditRecord;
use chrono::{DateTime, Utc};
use im::{OrdMap, OrdSet, Vector};
use isg_core::{
    Candidate, CandidateId, ChangeRequestId, CommitId, Direction, Edge, EdgeKind, Entity, EntityId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lifecycle status of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "commit")]
pub enum CandidateStatus {
    Pending,
    Committed(CommitId),
    Discarded,
}

/// Candidate plus its store-side bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub candidate: Candidate,
    pub status: CandidateStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl CandidateRecord {
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == CandidateStatus::Pending
    }
}

/// State needed to undo one commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSnapshot {
    /// Prior committed entity per touched id; `None` for entities the commit created
    pub prior: Vec<(EntityId, Option<Entity>)>,
    /// Current edges incident to touched entities before the commit
    pub prior_edges: Vec<Edge>,
    /// Candidate edges the commit promoted to current
    pub promoted_edges: Vec<Edge>,
}

/// A committed change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: CommitId,
    /// Monotonic commit order
    pub seq: u64,
    pub candidate: CandidateId,
    pub change_request: ChangeRequestId,
    pub entities: Vec<EntityId>,
    pub approval: String,
    pub committed_at: DateTime<Utc>,
    #[serde(default)]
    pub rolled_back_at: Option<DateTime<Utc>>,
    /// Dropped once every touched entity has been re-committed and the
    /// retention limit is exceeded
    #[serde(default)]
    pub snapshot: Option<CommitSnapshot>,
}

impl CommitRecord {
    #[inline]
    #[must_use]
    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back_at.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct GraphState {
    pub(crate) entities: OrdMap<EntityId, Entity>,
    pub(crate) outgoing: OrdMap<EntityId, OrdSet<Edge>>,
    pub(crate) incoming: OrdMap<EntityId, OrdSet<Edge>>,
    pub(crate) candidates: OrdMap<CandidateId, CandidateRecord>,
    pub(crate) candidate_edges: OrdMap<CandidateId, Vector<Edge>>,
    pub(crate) in_flight: OrdMap<EntityId, CandidateId>,
    pub(crate) commits: OrdMap<CommitId, CommitRecord>,
    pub(crate) commit_seq: u64,
    pub(crate) audit: Vector<AuditRecord>,
    pub(crate) version: u64,
}

impl GraphState {
    pub(crate) fn add_edge(&mut self, edge: Edge) {
        let mut out = self.outgoing.get(&edge.from).cloned().unwrap_or_default();
        out.insert(edge.clone());
        self.outgoing.insert(edge.from.clone(), out);

        let mut inc = self.incoming.get(&edge.to).cloned().unwrap_or_default();
        inc.insert(edge.clone());
        self.incoming.insert(edge.to.clone(), inc);
    }

    pub(crate) fn remove_edge(&mut self, edge: &Edge) {
        if let Some(mut out) = self.outgoing.get(&edge.from).cloned() {
            out.remove(edge);
            if out.is_empty() {
                self.outgoing.remove(&edge.from);
            } else {
                self.outgoing.insert(edge.from.clone(), out);
            }
        }
        if let Some(mut inc) = self.incoming.get(&edge.to).cloned() {
            inc.remove(edge);
            if inc.is_empty() {
                self.incoming.remove(&edge.to);
            } else {
                self.incoming.insert(edge.to.clone(), inc);
            }
        }
    }

    /// Current edges leaving or entering `id`
    pub(crate) fn incident_edges(&self, id: &EntityId) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .outgoing
            .get(id)
            .into_iter()
            .chain(self.incoming.get(id))
            .flat_map(|set| set.iter().cloned())
            .collect();
        edges.sort();
        edges.dedup();
        edges
    }

    pub(crate) fn remove_incident(&mut self, id: &EntityId) -> Vec<Edge> {
        let edges = self.incident_edges(id);
        for edge in &edges {
            self.remove_edge(edge);
        }
        edges
    }

    /// First in-flight entity overlapping `id`: itself, an ancestor, or a descendant
    pub(crate) fn in_flight_overlap(&self, id: &EntityId) -> Option<(EntityId, CandidateId)> {
        if let Some(holder) = self.in_flight.get(id) {
            return Some((id.clone(), *holder));
        }
        for ancestor in id.ancestors() {
            if let Some(holder) = self.in_flight.get(&ancestor) {
                return Some((ancestor, *holder));
            }
        }
        self.in_flight
            .range(id.clone()..)
            .take_while(|(held, _)| id.is_prefix_of(held))
            .map(|(held, holder)| (held.clone(), *holder))
            .next()
    }

    pub(crate) fn edges_of(&self, id: &EntityId, direction: Direction, kinds: &[EdgeKind]) -> Vec<Edge> {
        let keep = |e: &&Edge| kinds.is_empty() || kinds.contains(&e.kind);
        let mut edges = Vec::new();
        if direction.includes_outgoing() {
            if let Some(set) = self.outgoing.get(id) {
                edges.extend(set.iter().filter(keep).cloned());
            }
        }
        if direction.includes_incoming() {
            if let Some(set) = self.incoming.get(id) {
                edges.extend(set.iter().filter(keep).cloned());
            }
        }
        edges
    }

    pub(crate) fn entities_under(&self, prefix: &EntityId) -> Vec<&Entity> {
        self.entities
            .range(prefix.clone()..)
            .take_while(|(id, _)| prefix.is_prefix_of(id))
            .map(|(_, e)| e)
            .collect()
    }
}

/// Read access shared by the current graph and projected futures
pub trait GraphRead: Send + Sync {
    /// Entity by id
    fn entity(&self, id: &EntityId) -> Option<&Entity>;

    /// Edges touching `id`; an empty `kinds` slice means every kind
    fn edges(&self, id: &EntityId, direction: Direction, kinds: &[EdgeKind]) -> Vec<Edge>;

    /// All entities in id order
    fn entities(&self) -> Box<dyn Iterator<Item = &Entity> + '_>;

    /// Entities whose id starts with `prefix`, including `prefix` itself
    fn entities_under(&self, prefix: &EntityId) -> Vec<&Entity>;

    /// Number of entities
    fn entity_count(&self) -> usize;

    /// Edge count in one direction
    fn degree(&self, id: &EntityId, direction: Direction) -> usize {
        self.edges(id, direction, &[]).len()
    }

    fn contains(&self, id: &EntityId) -> bool {
        self.entity(id).is_some()
    }

    /// Entities whose final path segment is `name`
    fn find_by_name(&self, name: &str) -> Vec<&Entity> {
        self.entities().filter(|e| e.id.name() == name).collect()
    }
}

/// Immutable point-in-time view of the store
///
/// Cheap to clone; later writes never affect an existing snapshot.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub(crate) state: Arc<GraphState>,
}

impl GraphSnapshot {
    /// Store version this snapshot was taken at
    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.version
    }

    #[must_use]
    pub fn candidate(&self, id: &CandidateId) -> Option<&CandidateRecord> {
        self.state.candidates.get(id)
    }

    pub fn candidates(&self) -> impl Iterator<Item = &CandidateRecord> {
        self.state.candidates.values()
    }

    /// Candidate holding `id`, if any
    #[must_use]
    pub fn in_flight(&self, id: &EntityId) -> Option<CandidateId> {
        self.state.in_flight.get(id).copied()
    }

    #[must_use]
    pub fn commit(&self, id: &CommitId) -> Option<&CommitRecord> {
        self.state.commits.get(id)
    }

    /// Commits in commit order
    #[must_use]
    pub fn commits(&self) -> Vec<&CommitRecord> {
        let mut commits: Vec<&CommitRecord> = self.state.commits.values().collect();
        commits.sort_by_key(|c| c.seq);
        commits
    }

    pub fn audit(&self) -> impl Iterator<Item = &AuditRecord> {
        self.state.audit.iter()
    }
}

impl GraphRead for GraphSnapshot {
    fn entity(&self, id: &EntityId) -> Option<&Entity> {
        self.state.entities.get(id)
    }

    fn edges(&self, id: &EntityId, direction: Direction, kinds: &[EdgeKind]) -> Vec<Edge> {
        self.state.edges_of(id, direction, kinds)
    }

    fn entities(&self) -> Box<dyn Iterator<Item = &Entity> + '_> {
        Box::new(self.state.entities.values())
    }

    fn entities_under(&self, prefix: &EntityId) -> Vec<&Entity> {
        self.state.entities_under(prefix)
    }

    fn entity_count(&self) -> usize {
        self.state.entities.len()
    }

    fn degree(&self, id: &EntityId, direction: Direction) -> usize {
        let out = if direction.includes_outgoing() {
            self.state.outgoing.get(id).map_or(0, OrdSet::len)
        } else {
            0
        };
        let inc = if direction.includes_incoming() {
            self.state.incoming.get(id).map_or(0, OrdSet::len)
        } else {
            0
        };
        out + inc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isg_core::{ContentHash, EntityKind};

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    fn cid(tag: &[u8]) -> CandidateId {
        CandidateId::from_hash(ContentHash::compute(tag))
    }

    #[test]
    fn in_flight_overlap_checks_both_directions() {
        let mut state = GraphState::default();
        state.in_flight.insert(id("rt::task"), cid(b"module"));
        state.in_flight.insert(id("rt::net::serve"), cid(b"serve"));

        let (held, holder) = state.in_flight_overlap(&id("rt::task::spawn")).unwrap();
        assert_eq!(held, id("rt::task"));
        assert_eq!(holder, cid(b"module"));

        let (held, _) = state.in_flight_overlap(&id("rt::net")).unwrap();
        assert_eq!(held, id("rt::net::serve"));

        assert!(state.in_flight_overlap(&id("rt::io")).is_none());
        assert!(state.in_flight_overlap(&id("rt::netx")).is_none());
    }

    #[test]
    fn edges_are_indexed_both_ways() {
        let mut state = GraphState::default();
        let e = Edge::current(id("a::f"), id("a::g"), EdgeKind::Calls);
        state.add_edge(e.clone());
        assert_eq!(state.edges_of(&id("a::g"), Direction::Incoming, &[]), vec![e.clone()]);
        assert!(state.edges_of(&id("a::g"), Direction::Outgoing, &[]).is_empty());
        assert!(state
            .edges_of(&id("a::f"), Direction::Outgoing, &[EdgeKind::Contains])
            .is_empty());

        assert_eq!(state.remove_incident(&id("a::f")), vec![e]);
        assert!(state.outgoing.is_empty());
        assert!(state.incoming.is_empty());
    }

    #[test]
    fn prefix_scan_stops_at_siblings() {
        let mut state = GraphState::default();
        for s in ["rt", "rt::net", "rt::task", "rt::task::spawn", "rt::taskx"] {
            state.entities.insert(id(s), Entity::new(id(s), EntityKind::Module));
        }
        let under: Vec<String> = state
            .entities_under(&id("rt::task"))
            .iter()
            .map(|e| e.id.to_string())
            .collect();
        assert_eq!(under, vec!["rt::task", "rt::task::spawn"]);
    }
}
