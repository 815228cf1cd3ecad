//! Bounded breadth-first expansion from seed entities

use indexmap::IndexMap;
use isg_core::{Direction, EdgeKind, EntityId};
use isg_graph::GraphRead;
use std::collections::HashSet;

/// An entity reached by traversal
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reached {
    pub(crate) id: EntityId,
    pub(crate) hop: u32,
}

impl Reached {
    /// Graph proximity in `(0, 1]`, 1 at the seeds
    pub(crate) fn proximity(&self) -> f64 {
        1.0 / (1.0 + f64::from(self.hop))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Limits<'a> {
    pub(crate) max_hops: u32,
    pub(crate) fanout: usize,
    pub(crate) edge_kinds: &'a [EdgeKind],
    pub(crate) direction: Direction,
}

/// Expand up to `max_hops` from `seeds`, keeping at most `fanout` new
/// entities per hop
///
/// Each hop ranks newly reached entities by salience: `(1 + in) * (1 + out)`
/// scaled by how many frontier entities link to them. Ties break by id so
/// the expansion is deterministic.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn expand(graph: &dyn GraphRead, seeds: &[EntityId], limits: &Limits<'_>) -> Vec<Reached> {
    let mut visited: HashSet<EntityId> = seeds.iter().cloned().collect();
    let mut frontier: Vec<EntityId> = seeds.to_vec();
    let mut reached = Vec::new();

    for hop in 1..=limits.max_hops {
        let mut links: IndexMap<EntityId, usize> = IndexMap::new();
        for id in &frontier {
            for edge in graph.edges(id, limits.direction, limits.edge_kinds) {
                let other = edge.other(id);
                if visited.contains(other) || !graph.contains(other) {
                    continue;
                }
                *links.entry(other.clone()).or_default() += 1;
            }
        }
        if links.is_empty() {
            break;
        }

        let mut scored: Vec<(EntityId, f64)> = links
            .into_iter()
            .map(|(id, count)| {
                let inc = graph.degree(&id, Direction::Incoming) as f64;
                let out = graph.degree(&id, Direction::Outgoing) as f64;
                let salience = (1.0 + inc) * (1.0 + out) * count as f64;
                (id, salience)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(limits.fanout);

        frontier = Vec::with_capacity(scored.len());
        for (id, _) in scored {
            visited.insert(id.clone());
            frontier.push(id.clone());
            reached.push(Reached { id, hop });
        }
    }
    reached
}
