//! Hybrid retrieval: bounded graph expansion fused with vector similarity

use crate::error::RetrievalError;
use crate::traversal::{self, Limits, Reached};
use crate::vector::{centroid, ExactVectorIndex, Metric, VectorIndex};
use indexmap::IndexMap;
use isg_core::{Direction, EdgeKind, Entity, EntityId, EntityKind};
use isg_graph::GraphRead;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use tracing::{debug, warn};

/// Retrieval tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Maximum entities returned, raised to the seed count when needed
    pub hard_cap: usize,
    pub default_max_hops: u32,
    pub default_k_vector: usize,
    /// Newly reached entities kept per hop
    pub fanout_per_hop: usize,
    pub graph_weight: f64,
    pub vector_weight: f64,
    pub metric: Metric,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hard_cap: 50,
            default_max_hops: 2,
            default_k_vector: 8,
            fanout_per_hop: 16,
            graph_weight: 0.6,
            vector_weight: 0.4,
            metric: Metric::Cosine,
        }
    }
}

/// Restrictions on what retrieval may return
///
/// Seeds are never filtered out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalFilters {
    /// Allowed entity kinds, empty for any
    pub kinds: Vec<EntityKind>,
    /// Restrict results to this namespace
    pub under: Option<EntityId>,
    pub exclude: Vec<EntityId>,
    /// Edge kinds traversal may follow, empty for any
    pub edge_kinds: Vec<EdgeKind>,
    pub direction: Direction,
}

impl RetrievalFilters {
    #[must_use]
    pub fn accepts(&self, entity: &Entity) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&entity.kind))
            && self.under.as_ref().map_or(true, |p| p.is_prefix_of(&entity.id))
            && !self.exclude.contains(&entity.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub seeds: Vec<EntityId>,
    pub max_hops: u32,
    pub k_vector: usize,
    #[serde(default)]
    pub filters: RetrievalFilters,
}

impl RetrievalRequest {
    #[must_use]
    pub fn new(seeds: Vec<EntityId>, max_hops: u32, k_vector: usize) -> Self {
        Self {
            seeds,
            max_hops,
            k_vector,
            filters: RetrievalFilters::default(),
        }
    }

    #[must_use]
    pub fn with_filters(mut self, filters: RetrievalFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// How an entity entered the result, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Seed,
    /// One hop from a seed
    Interface,
    Transitive,
    /// Reached by vector similarity alone
    Semantic,
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Seed => "seed",
            Self::Interface => "interface",
            Self::Transitive => "transitive",
            Self::Semantic => "semantic",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedEntry {
    pub entity: Entity,
    pub level: Level,
    /// Hops from the nearest seed, `None` when only vector search found it
    pub hop: Option<u32>,
    pub graph_proximity: f64,
    pub vector_similarity: Option<f64>,
    pub score: f64,
}

/// Why a retrieval returned less than it was asked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Degradation {
    UnknownSeed(EntityId),
    /// No seed has an embedding, so there was nothing to search with
    NoSeedEmbedding,
    VectorUnavailable(String),
}

impl Display for Degradation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSeed(id) => write!(f, "unknown seed {id}"),
            Self::NoSeedEmbedding => f.write_str("no seed embedding, graph-only ranking"),
            Self::VectorUnavailable(reason) => write!(f, "vector index unavailable: {reason}"),
        }
    }
}

/// Deduplicated, ranked retrieval result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankedList {
    pub entries: Vec<RankedEntry>,
    pub degraded: Vec<Degradation>,
    /// Entries dropped by the hard cap
    pub truncated: usize,
    /// `false` when the request asked for no expansion and only seeds came back
    pub ranked: bool,
}

impl RankedList {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &EntityId> {
        self.entries.iter().map(|e| &e.entity.id)
    }

    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.ids().any(|i| i == id)
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    /// Seeds and their direct interfaces
    #[must_use]
    pub fn required(&self) -> Vec<EntityId> {
        self.entries
            .iter()
            .filter(|e| e.level <= Level::Interface)
            .map(|e| e.entity.id.clone())
            .collect()
    }

    /// Share of vector hits that graph expansion also reached
    ///
    /// `None` when vector search contributed nothing.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn agreement(&self) -> Option<f64> {
        let (both, total) = self
            .entries
            .iter()
            .filter(|e| e.level != Level::Seed && e.vector_similarity.is_some())
            .fold((0usize, 0usize), |(both, total), e| {
                (both + usize::from(e.hop.is_some()), total + 1)
            });
        (total > 0).then(|| both as f64 / total as f64)
    }
}

#[derive(Default)]
struct Acc {
    hop: Option<u32>,
    proximity: f64,
    similarity: Option<f64>,
}

/// Retrieval over any [`GraphRead`], current or projected
#[derive(Debug, Clone)]
pub struct RetrievalEngine {
    config: RetrievalConfig,
    index: Arc<dyn VectorIndex>,
}

impl RetrievalEngine {
    /// Engine backed by the exact index with the configured metric
    #[must_use]
    pub fn new(config: RetrievalConfig) -> Self {
        let index = Arc::new(ExactVectorIndex::new(config.metric));
        Self { config, index }
    }

    #[must_use]
    pub fn with_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = index;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Rank the entities relevant to `request.seeds`
    ///
    /// Seeds always appear first and are never dropped by filters or the cap.
    /// A failing vector index degrades the result to graph-only ranking.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::NoSeeds`] for an empty seed list and
    /// [`RetrievalError::AllSeedsUnknown`] when no seed resolves.
    pub fn retrieve(&self, graph: &dyn GraphRead, request: &RetrievalRequest) -> Result<RankedList, RetrievalError> {
        if request.seeds.is_empty() {
            return Err(RetrievalError::NoSeeds);
        }

        let mut degraded = Vec::new();
        let mut seeds: Vec<EntityId> = Vec::with_capacity(request.seeds.len());
        for seed in &request.seeds {
            if seeds.contains(seed) {
                continue;
            }
            if graph.contains(seed) {
                seeds.push(seed.clone());
            } else {
                degraded.push(Degradation::UnknownSeed(seed.clone()));
            }
        }
        if seeds.is_empty() {
            return Err(RetrievalError::AllSeedsUnknown(request.seeds.len()));
        }

        let seed_entry = |id: &EntityId| {
            graph.entity(id).map(|entity| RankedEntry {
                entity: entity.clone(),
                level: Level::Seed,
                hop: Some(0),
                graph_proximity: 1.0,
                vector_similarity: None,
                score: self.config.graph_weight,
            })
        };

        if request.max_hops == 0 && request.k_vector == 0 {
            return Ok(RankedList {
                entries: seeds.iter().filter_map(seed_entry).collect(),
                degraded,
                truncated: 0,
                ranked: false,
            });
        }

        let filters = &request.filters;
        let mut found: IndexMap<EntityId, Acc> = IndexMap::new();

        let limits = Limits {
            max_hops: request.max_hops,
            fanout: self.config.fanout_per_hop,
            edge_kinds: &filters.edge_kinds,
            direction: filters.direction,
        };
        for reached in traversal::expand(graph, &seeds, &limits) {
            let accepted = graph.entity(&reached.id).is_some_and(|e| filters.accepts(e));
            if accepted {
                let proximity = reached.proximity();
                let Reached { id, hop } = reached;
                found.insert(
                    id,
                    Acc {
                        hop: Some(hop),
                        proximity,
                        similarity: None,
                    },
                );
            }
        }

        if request.k_vector > 0 {
            let query = centroid(
                seeds
                    .iter()
                    .filter_map(|s| graph.entity(s))
                    .filter_map(|e| e.embedding.as_deref()),
            );
            match query {
                None => degraded.push(Degradation::NoSeedEmbedding),
                Some(query) => {
                    let accept = |e: &Entity| !seeds.contains(&e.id) && filters.accepts(e);
                    match self.index.search(graph, &query, request.k_vector, &accept) {
                        Ok(hits) => {
                            for hit in hits {
                                found.entry(hit.id).or_default().similarity = Some(hit.similarity);
                            }
                        }
                        Err(e) => {
                            warn!(index = self.index.name(), error = %e, "vector search failed, ranking by graph only");
                            degraded.push(Degradation::VectorUnavailable(e.to_string()));
                        }
                    }
                }
            }
        }

        let mut rest: Vec<RankedEntry> = found
            .into_iter()
            .filter_map(|(id, acc)| {
                let entity = graph.entity(&id)?.clone();
                let level = match acc.hop {
                    Some(1) => Level::Interface,
                    Some(_) => Level::Transitive,
                    None => Level::Semantic,
                };
                let score = self.config.graph_weight * acc.proximity
                    + self.config.vector_weight * acc.similarity.unwrap_or(0.0);
                Some(RankedEntry {
                    entity,
                    level,
                    hop: acc.hop,
                    graph_proximity: acc.proximity,
                    vector_similarity: acc.similarity,
                    score,
                })
            })
            .collect();
        rest.sort_by(|a, b| {
            a.level
                .cmp(&b.level)
                .then_with(|| b.score.total_cmp(&a.score))
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });

        let mut entries: Vec<RankedEntry> = seeds.iter().filter_map(seed_entry).collect();
        let cap = self.config.hard_cap.max(entries.len());
        let room = cap - entries.len();
        let truncated = rest.len().saturating_sub(room);
        rest.truncate(room);
        entries.extend(rest);

        debug!(
            seeds = seeds.len(),
            returned = entries.len(),
            truncated,
            degraded = degraded.len(),
            "retrieval complete"
        );

        Ok(RankedList {
            entries,
            degraded,
            truncated,
            ranked: true,
        })
    }
}

impl Default for RetrievalEngine {
    fn default() -> Self {
        Self::new(RetrievalConfig::default())
    }
}
