//! Entity graph store
//!
//! The store owns entity and edge persistence. Readers take a
//! [`GraphSnapshot`] (an `Arc` of the current state); writers run inside
//! [`GraphStore::transact`], which builds the next state from a cheap clone
//! and swaps it in only if every step, including persistence, succeeded.

use crate::error::{GraphError, StorageError};
use crate::persist::SnapshotStorage;
use crate::state::{GraphRead, GraphSnapshot, GraphState};
use crate::view::GraphView;
use isg_core::{
    CandidateId, Direction, Edge, EdgeKind, Entity, EntityId, EntityKind, ExtractionBatch,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Counts reported by [`GraphStore::upsert_entities`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub edges: usize,
}

/// Versioned, snapshot-consistent entity/edge store
#[derive(Debug)]
pub struct GraphStore {
    state: RwLock<Arc<GraphState>>,
    writer: Mutex<()>,
    storage: Option<SnapshotStorage>,
}

impl GraphStore {
    /// Empty in-memory store
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(GraphState::default())),
            writer: Mutex::new(()),
            storage: None,
        }
    }

    /// Durable store, loading an existing snapshot if there is one
    ///
    /// # Errors
    /// Returns error if an existing snapshot cannot be read
    pub fn open(storage: SnapshotStorage) -> Result<Self, StorageError> {
        let state = storage.load()?.unwrap_or_default();
        tracing::info!(
            path = %storage.path().display(),
            version = state.version,
            entities = state.entities.len(),
            "graph store opened"
        );
        Ok(Self {
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
            storage: Some(storage),
        })
    }

    /// Current point-in-time view
    #[must_use]
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            state: Arc::clone(&self.state.read()),
        }
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Number of current entities
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one all-or-nothing write
    ///
    /// Writers are serialized. `f` mutates a private copy; the copy is
    /// persisted and published only if `f` and persistence both succeed.
    pub(crate) fn transact<T, E>(
        &self,
        f: impl FnOnce(&mut GraphState) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let _writer = self.writer.lock();
        let mut next = GraphState::clone(&self.state.read());
        let out = f(&mut next)?;
        next.version += 1;
        if let Some(storage) = &self.storage {
            storage.persist(&next)?;
        }
        *self.state.write() = Arc::new(next);
        Ok(out)
    }

    /// Insert or refresh extracted entities and replace their outgoing edges
    ///
    /// Staged future state is preserved across refreshes.
    ///
    /// # Errors
    /// - [`GraphError::SchemaConflict`] if an id is re-used with another kind
    /// - [`GraphError::DanglingEdge`] / [`GraphError::TaggedEdge`] for bad edges
    /// - [`GraphError::EntityLocked`] if the committed code of an entity with an
    ///   in-flight candidate would change
    pub fn upsert_entities(&self, batch: ExtractionBatch) -> Result<UpsertReport, GraphError> {
        let mut kinds: BTreeMap<&EntityId, EntityKind> = BTreeMap::new();
        for e in &batch.entities {
            if let Some(prev) = kinds.insert(&e.id, e.kind) {
                if prev != e.kind {
                    return Err(GraphError::SchemaConflict {
                        id: e.id.clone(),
                        existing: prev,
                        incoming: e.kind,
                    });
                }
            }
        }

        let report = self.transact(|state| {
            let mut report = UpsertReport::default();
            let refreshed: BTreeSet<EntityId> =
                batch.entities.iter().map(|e| e.id.clone()).collect();

            for extracted in batch.entities {
                match state.entities.get(&extracted.id) {
                    Some(existing) if existing.kind != extracted.kind => {
                        return Err(GraphError::SchemaConflict {
                            id: extracted.id,
                            existing: existing.kind,
                            incoming: extracted.kind,
                        });
                    }
                    Some(existing) if extracted.matches(existing) => report.unchanged += 1,
                    Some(existing) => {
                        if existing.current_code != extracted.code {
                            if let Some(holder) = state.in_flight.get(&extracted.id) {
                                return Err(GraphError::EntityLocked {
                                    id: extracted.id,
                                    candidate: *holder,
                                });
                            }
                        }
                        let mut entity = existing.clone();
                        entity.refresh_from(extracted);
                        state.entities.insert(entity.id.clone(), entity);
                        report.updated += 1;
                    }
                    None => {
                        state.entities.insert(extracted.id.clone(), Entity::from(extracted));
                        report.inserted += 1;
                    }
                }
            }

            for id in &refreshed {
                let stale: Vec<Edge> = state.edges_of(id, Direction::Outgoing, &[]);
                for edge in &stale {
                    state.remove_edge(edge);
                }
            }

            for edge in batch.edges {
                if let Some(candidate) = edge.candidate {
                    return Err(GraphError::TaggedEdge {
                        from: edge.from,
                        to: edge.to,
                        candidate,
                    });
                }
                for endpoint in [&edge.from, &edge.to] {
                    if !state.entities.contains_key(endpoint) {
                        return Err(GraphError::DanglingEdge {
                            from: edge.from.clone(),
                            to: edge.to.clone(),
                            missing: endpoint.clone(),
                        });
                    }
                }
                state.add_edge(edge);
                report.edges += 1;
            }
            Ok(report)
        })?;

        tracing::debug!(
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            edges = report.edges,
            "entities upserted"
        );
        Ok(report)
    }

    /// Remove entities the extractor no longer sees, with their edges
    ///
    /// # Errors
    /// Returns [`GraphError::EntityLocked`] if any id has an in-flight candidate
    pub fn retire_entities(&self, ids: &[EntityId]) -> Result<usize, GraphError> {
        self.transact(|state| {
            let mut removed = 0;
            for id in ids {
                if let Some(holder) = state.in_flight.get(id) {
                    return Err(GraphError::EntityLocked {
                        id: id.clone(),
                        candidate: *holder,
                    });
                }
                if state.entities.remove(id).is_some() {
                    state.remove_incident(id);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    /// Entity by id
    ///
    /// # Errors
    /// Returns [`GraphError::EntityNotFound`] if absent
    pub fn get_entity(&self, id: &EntityId) -> Result<Entity, GraphError> {
        self.state
            .read()
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| GraphError::EntityNotFound(id.clone()))
    }

    /// Current edges touching `id`; empty `kinds` means every kind
    #[must_use]
    pub fn get_edges(&self, id: &EntityId, direction: Direction, kinds: &[EdgeKind]) -> Vec<Edge> {
        self.snapshot().edges(id, direction, kinds)
    }

    /// Read-only projection of a pending candidate's future graph
    ///
    /// # Errors
    /// Returns [`GraphError::CandidateNotPending`] unless the candidate is pending
    pub fn project_future(&self, candidate: &CandidateId) -> Result<GraphView, GraphError> {
        GraphView::project(self.snapshot(), candidate)
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isg_core::ExtractedEntity;
    use pretty_assertions::assert_eq;

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    fn func(s: &str, code: &str) -> ExtractedEntity {
        ExtractedEntity::new(id(s), EntityKind::Function, code)
    }

    fn seeded() -> GraphStore {
        let store = GraphStore::new();
        store
            .upsert_entities(
                ExtractionBatch::new()
                    .with_entity(func("rt::task::spawn", "fn spawn() {}"))
                    .with_entity(func("rt::net::serve", "fn serve() { spawn() }"))
                    .with_edge(id("rt::net::serve"), id("rt::task::spawn"), EdgeKind::Calls),
            )
            .unwrap();
        store
    }

    #[test]
    fn upsert_and_read_back() {
        let store = seeded();
        let spawn = store.get_entity(&id("rt::task::spawn")).unwrap();
        assert_eq!(spawn.current_code.as_deref(), Some("fn spawn() {}"));
        let callers = store.get_edges(&id("rt::task::spawn"), Direction::Incoming, &[EdgeKind::Calls]);
        assert_eq!(callers.len(), 1);
        assert_eq!(callers[0].from, id("rt::net::serve"));
    }

    #[test]
    fn reindexing_unchanged_source_is_stable() {
        let store = seeded();
        let before = store.get_entity(&id("rt::task::spawn")).unwrap();
        let report = store
            .upsert_entities(
                ExtractionBatch::new()
                    .with_entity(func("rt::task::spawn", "fn spawn() {}"))
                    .with_entity(func("rt::net::serve", "fn serve() { spawn() }"))
                    .with_edge(id("rt::net::serve"), id("rt::task::spawn"), EdgeKind::Calls),
            )
            .unwrap();
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.inserted + report.updated, 0);
        assert_eq!(store.get_entity(&id("rt::task::spawn")).unwrap(), before);
        assert_eq!(store.get_edges(&id("rt::net::serve"), Direction::Outgoing, &[]).len(), 1);
    }

    #[test]
    fn kind_collision_is_schema_conflict() {
        let store = seeded();
        let err = store
            .upsert_entities(ExtractionBatch::new().with_entity(ExtractedEntity::new(
                id("rt::task::spawn"),
                EntityKind::Type,
                "struct spawn;",
            )))
            .unwrap_err();
        assert!(err.is_schema_conflict());
        assert!(matches!(err, GraphError::SchemaConflict { .. }));
    }

    #[test]
    fn failed_upsert_leaves_state_untouched() {
        let store = seeded();
        let version = store.version();
        let err = store
            .upsert_entities(
                ExtractionBatch::new()
                    .with_entity(func("rt::io::read", "fn read() {}"))
                    .with_edge(id("rt::io::read"), id("rt::io::missing"), EdgeKind::Calls),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::DanglingEdge { .. }));
        assert_eq!(store.version(), version);
        assert!(store.get_entity(&id("rt::io::read")).is_err());
    }

    #[test]
    fn refresh_replaces_outgoing_edges() {
        let store = seeded();
        store
            .upsert_entities(
                ExtractionBatch::new().with_entity(func("rt::net::serve", "fn serve() {}")),
            )
            .unwrap();
        assert!(store
            .get_edges(&id("rt::task::spawn"), Direction::Incoming, &[])
            .is_empty());
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let store = seeded();
        let snap = store.snapshot();
        store
            .upsert_entities(ExtractionBatch::new().with_entity(func("rt::io::read", "fn read() {}")))
            .unwrap();
        assert!(snap.entity(&id("rt::io::read")).is_none());
        assert!(store.snapshot().entity(&id("rt::io::read")).is_some());
        assert!(store.version() > snap.version());
    }

    #[test]
    fn retire_removes_edges() {
        let store = seeded();
        assert_eq!(store.retire_entities(&[id("rt::net::serve")]).unwrap(), 1);
        assert!(store
            .get_edges(&id("rt::task::spawn"), Direction::Both, &[])
            .is_empty());
    }

    #[test]
    fn durable_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = GraphStore::open(SnapshotStorage::in_dir(dir.path())).unwrap();
            store
                .upsert_entities(ExtractionBatch::new().with_entity(func("a::f", "fn f() {}")))
                .unwrap();
        }
        let store = GraphStore::open(SnapshotStorage::in_dir(dir.path())).unwrap();
        assert_eq!(store.version(), 1);
        assert!(store.get_entity(&id("a::f")).is_ok());
    }
}
