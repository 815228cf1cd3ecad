//! Extractor batches

use crate::edge::{Edge, EdgeKind};
use crate::entity::ExtractedEntity;
use crate::id::EntityId;
use serde::{Deserialize, Serialize};

/// Entities and derived edges produced by one extractor pass
///
/// Edges listed here replace the outgoing current edges of every entity
/// in the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionBatch {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl ExtractionBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entity(mut self, entity: ExtractedEntity) -> Self {
        self.entities.push(entity);
        self
    }

    #[must_use]
    pub fn with_edge(mut self, from: EntityId, to: EntityId, kind: EdgeKind) -> Self {
        self.edges.push(Edge::current(from, to, kind));
        self
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.edges.is_empty()
    }
}
