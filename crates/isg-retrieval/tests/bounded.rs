//! Retrieval stays bounded and well-formed on large graphs

use isg_core::EntityId;
use isg_graph::{GraphRead, GraphStore};
use isg_retrieval::{
    ContextAssembler, ContextRequest, Level, RetrievalConfig, RetrievalEngine, RetrievalRequest, SizeFn,
};
use isg_test_utils::synthetic_graph;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::OnceLock;

const NODES: usize = 10_000;

fn store() -> &'static GraphStore {
    static STORE: OnceLock<GraphStore> = OnceLock::new();
    STORE.get_or_init(|| {
        let store = GraphStore::new();
        store.upsert_entities(synthetic_graph(NODES, 6, 8)).unwrap();
        store
    })
}

fn seed_ids(picks: &[usize]) -> Vec<EntityId> {
    let snap = store().snapshot();
    let all: Vec<EntityId> = snap.entities().map(|e| e.id.clone()).collect();
    picks.iter().map(|i| all[i % all.len()].clone()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn ranked_list_respects_cap_and_order(
        picks in proptest::collection::vec(0..NODES, 1..6),
        hops in 0u32..5,
        k in 0usize..40,
        cap in 1usize..80,
    ) {
        let engine = RetrievalEngine::new(RetrievalConfig { hard_cap: cap, ..RetrievalConfig::default() });
        let seeds = seed_ids(&picks);
        let snap = store().snapshot();
        let list = engine.retrieve(&snap, &RetrievalRequest::new(seeds.clone(), hops, k)).unwrap();

        let distinct: HashSet<&EntityId> = seeds.iter().collect();
        prop_assert!(list.len() <= cap.max(distinct.len()));

        let mut seen = HashSet::new();
        for e in &list.entries {
            prop_assert!(seen.insert(e.entity.id.clone()), "duplicate {}", e.entity.id);
        }
        for (i, e) in list.entries.iter().enumerate() {
            prop_assert_eq!(e.level == Level::Seed, i < distinct.len());
            if let Some(hop) = e.hop {
                prop_assert!(hop <= hops);
            }
        }
        for pair in list.entries.windows(2) {
            prop_assert!(pair[0].level <= pair[1].level);
        }
    }

    #[test]
    fn bundle_never_exceeds_budget_beyond_seeds(
        picks in proptest::collection::vec(0..NODES, 1..3),
        budget in 0usize..4_000,
    ) {
        let seeds = seed_ids(&picks);
        let snap = store().snapshot();
        let list = RetrievalEngine::default()
            .retrieve(&snap, &RetrievalRequest::new(seeds, 2, 8))
            .unwrap();
        let bundle = ContextAssembler::new(SizeFn::Chars)
            .pack(&list, &ContextRequest::new(budget).with_focus("focus"));

        for entry in list.entries.iter().filter(|e| e.level == Level::Seed) {
            prop_assert!(bundle.contains(&entry.entity.id));
        }
        if !bundle.over_budget {
            prop_assert!(bundle.used <= budget);
        }
        prop_assert_eq!(bundle.items.len() + bundle.dropped.len(), list.len());
    }
}
