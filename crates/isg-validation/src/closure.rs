//! Minimal test closure of a change

use isg_core::{Direction, EdgeKind, EntityId, EntityKind};
use isg_graph::GraphRead;
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Edges along which a change can break a dependent
pub(crate) const DEPENDENT_EDGES: [EdgeKind; 3] = [EdgeKind::Calls, EdgeKind::DependsOn, EdgeKind::Implements];

/// Tests that transitively reach any of `changed`, within `max_depth` hops
///
/// Walks incoming dependency edges backwards. Changed entities that are
/// themselves tests are included. The result is sorted.
#[must_use]
pub fn test_closure<'a>(
    graph: &dyn GraphRead,
    changed: impl IntoIterator<Item = &'a EntityId>,
    max_depth: u32,
) -> Vec<EntityId> {
    let mut seen: HashSet<EntityId> = HashSet::new();
    let mut queue: VecDeque<(EntityId, u32)> = VecDeque::new();
    for id in changed {
        if seen.insert(id.clone()) {
            queue.push_back((id.clone(), 0));
        }
    }

    let mut tests = BTreeSet::new();
    while let Some((id, depth)) = queue.pop_front() {
        if graph.entity(&id).is_some_and(|e| e.kind == EntityKind::Test) {
            tests.insert(id.clone());
        }
        if depth >= max_depth {
            continue;
        }
        for edge in graph.edges(&id, Direction::Incoming, &DEPENDENT_EDGES) {
            if seen.insert(edge.from.clone()) {
                queue.push_back((edge.from, depth + 1));
            }
        }
    }
    tests.into_iter().collect()
}
