//! Durable graph snapshots
//!
//! The whole graph state is written as one JSON document via
//! write-temp, fsync, rename. A reader therefore sees either the previous
//! snapshot or the next one, never a torn write.

use crate::audit::AuditRecord;
use crate::error::StorageError;
use crate::state::{CandidateRecord, CommitRecord, GraphState};
use im::Vector;
use isg_core::{CandidateId, Edge, Entity};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the graph snapshot inside a store directory
pub const SNAPSHOT_FILE: &str = "graph.json";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedGraph {
    version: u64,
    commit_seq: u64,
    entities: Vec<Entity>,
    edges: Vec<Edge>,
    candidates: Vec<CandidateRecord>,
    candidate_edges: Vec<(CandidateId, Vec<Edge>)>,
    commits: Vec<CommitRecord>,
    audit: Vec<AuditRecord>,
}

impl PersistedGraph {
    fn capture(state: &GraphState) -> Self {
        Self {
            version: state.version,
            commit_seq: state.commit_seq,
            entities: state.entities.values().cloned().collect(),
            edges: state
                .outgoing
                .values()
                .flat_map(|set| set.iter().cloned())
                .collect(),
            candidates: state.candidates.values().cloned().collect(),
            candidate_edges: state
                .candidate_edges
                .iter()
                .map(|(id, edges)| (*id, edges.iter().cloned().collect()))
                .collect(),
            commits: state.commits.values().cloned().collect(),
            audit: state.audit.iter().cloned().collect(),
        }
    }

    fn restore(self) -> GraphState {
        let mut state = GraphState {
            version: self.version,
            commit_seq: self.commit_seq,
            ..GraphState::default()
        };
        for entity in self.entities {
            state.entities.insert(entity.id.clone(), entity);
        }
        for edge in self.edges {
            state.add_edge(edge);
        }
        for record in self.candidates {
            if record.is_pending() {
                for target in record.candidate.affected() {
                    state.in_flight.insert(target.clone(), record.candidate.id);
                }
            }
            state.candidates.insert(record.candidate.id, record);
        }
        for (id, edges) in self.candidate_edges {
            state.candidate_edges.insert(id, edges.into_iter().collect::<Vector<_>>());
        }
        for commit in self.commits {
            state.commits.insert(commit.id, commit);
        }
        state.audit = self.audit.into_iter().collect();
        state
    }
}

/// Snapshot file with bounded write retries
#[derive(Debug, Clone)]
pub struct SnapshotStorage {
    path: PathBuf,
    retries: u32,
    backoff: Duration,
}

impl SnapshotStorage {
    /// Storage for `dir/graph.json`
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(SNAPSHOT_FILE),
            retries: 3,
            backoff: Duration::from_millis(20),
        }
    }

    /// Retry budget for failed writes
    #[must_use]
    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn load(&self) -> Result<Option<GraphState>, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };
        let persisted: PersistedGraph = serde_json::from_slice(&bytes)?;
        Ok(Some(persisted.restore()))
    }

    /// Write `state`, retrying with exponential backoff
    pub(crate) fn persist(&self, state: &GraphState) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(&PersistedGraph::capture(state))?;
        let mut attempt = 0;
        loop {
            match atomic_write(&self.path, &bytes) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retries => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt);
                    tracing::warn!(attempt, ?delay, error = %e, "snapshot write failed, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(StorageError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(e),
                    })
                }
            }
        }
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::io(path, std::io::ErrorKind::InvalidInput.into()))?;
    fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StorageError::io(parent, e))?;
    tmp.write_all(bytes).map_err(|e| StorageError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| StorageError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| StorageError::io(path, e.error))?;
    sync_parent_dir(parent).map_err(|e| StorageError::io(parent, e))
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use isg_core::{EdgeKind, EntityKind};

    fn id(s: &str) -> isg_core::EntityId {
        s.parse().unwrap()
    }

    #[test]
    fn snapshot_restores_entities_and_edges() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SnapshotStorage::in_dir(dir.path());

        let mut state = GraphState::default();
        for s in ["a::f", "a::g"] {
            state
                .entities
                .insert(id(s), Entity::new(id(s), EntityKind::Function).with_code("fn x() {}"));
        }
        state.add_edge(Edge::current(id("a::f"), id("a::g"), EdgeKind::Calls));
        state.version = 7;
        storage.persist(&state).unwrap();

        let restored = storage.load().unwrap().unwrap();
        assert_eq!(restored.version, 7);
        assert_eq!(restored.entities.len(), 2);
        assert_eq!(
            restored.edges_of(&id("a::g"), isg_core::Direction::Incoming, &[]).len(),
            1
        );
    }

    #[test]
    fn missing_snapshot_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SnapshotStorage::in_dir(dir.path()).load().unwrap().is_none());
    }
}
