//! Vector similarity search over entity embeddings

use crate::error::RetrievalError;
use isg_core::{Entity, EntityId};
use isg_graph::GraphRead;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Distance metric, normalized to a similarity in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Cosine,
    L2,
}

impl Metric {
    /// Similarity of two equal-length vectors
    #[must_use]
    pub fn similarity(self, a: &[f32], b: &[f32]) -> f64 {
        match self {
            Self::Cosine => {
                let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
                for (x, y) in a.iter().zip(b) {
                    let (x, y) = (f64::from(*x), f64::from(*y));
                    dot += x * y;
                    na += x * x;
                    nb += y * y;
                }
                if na == 0.0 || nb == 0.0 {
                    return 0.0;
                }
                let cos = (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0);
                (cos + 1.0) / 2.0
            }
            Self::L2 => {
                let dist = a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| {
                        let d = f64::from(*x) - f64::from(*y);
                        d * d
                    })
                    .sum::<f64>()
                    .sqrt();
                1.0 / (1.0 + dist)
            }
        }
    }
}

/// A single nearest-neighbour result
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: EntityId,
    pub similarity: f64,
}

/// Nearest-neighbour search over the embeddings visible in a graph
///
/// Implementations may be approximate. The engine treats an `Err` as a
/// degraded retrieval, never as a failed one.
pub trait VectorIndex: Send + Sync + Debug {
    /// Up to `k` accepted entities most similar to `query`, best first
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::IndexUnavailable`] when the index cannot
    /// serve the query.
    fn search(
        &self,
        graph: &dyn GraphRead,
        query: &[f32],
        k: usize,
        accept: &dyn Fn(&Entity) -> bool,
    ) -> Result<Vec<VectorHit>, RetrievalError>;

    fn name(&self) -> &'static str;
}

/// Brute-force index scanning every embedding in the graph
///
/// Entities whose embedding dimension differs from the query are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactVectorIndex {
    metric: Metric,
}

impl ExactVectorIndex {
    #[must_use]
    pub fn new(metric: Metric) -> Self {
        Self { metric }
    }

    #[must_use]
    pub fn metric(&self) -> Metric {
        self.metric
    }
}

impl VectorIndex for ExactVectorIndex {
    fn search(
        &self,
        graph: &dyn GraphRead,
        query: &[f32],
        k: usize,
        accept: &dyn Fn(&Entity) -> bool,
    ) -> Result<Vec<VectorHit>, RetrievalError> {
        if k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }
        let pool: Vec<(&EntityId, &[f32])> = graph
            .entities()
            .filter(|e| accept(e))
            .filter_map(|e| e.embedding.as_deref().map(|v| (&e.id, v)))
            .filter(|(_, v)| v.len() == query.len())
            .collect();

        let metric = self.metric;
        let mut hits: Vec<VectorHit> = pool
            .par_iter()
            .map(|(id, v)| VectorHit {
                id: (*id).clone(),
                similarity: metric.similarity(query, v),
            })
            .collect();
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    fn name(&self) -> &'static str {
        "exact"
    }
}

/// Mean of the given embeddings, ignoring those whose dimension differs
/// from the first
#[allow(clippy::cast_precision_loss)]
pub(crate) fn centroid<'a>(embeddings: impl IntoIterator<Item = &'a [f32]>) -> Option<Vec<f32>> {
    let mut iter = embeddings.into_iter();
    let first = iter.next()?;
    let mut sum: Vec<f64> = first.iter().map(|x| f64::from(*x)).collect();
    let dims = sum.len();
    let mut count = 1usize;
    for v in iter.filter(|v| v.len() == dims) {
        for (s, x) in sum.iter_mut().zip(v) {
            *s += f64::from(*x);
        }
        count += 1;
    }
    #[allow(clippy::cast_possible_truncation)]
    Some(sum.into_iter().map(|s| (s / count as f64) as f32).collect())
}
