//! # Property-Based Tests
//!
//! Reference-graph invariants checked with proptest over randomly built
//! claim/deferral graphs.

#![allow(clippy::unwrap_used, clippy::panic)]

use proptest::collection::{btree_set, vec};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use tempfile::{TempDir, tempdir};
use tessera_core::{
    Entity, EntityRef, ProcessedEntityUpdate, ProcessingStore, ReferenceSource,
    RefreshStateReference, ReplaceUnprocessedEntities, StoreConfig,
};

const NODES: u8 = 8;

fn open_store() -> (TempDir, ProcessingStore) {
    let dir = tempdir().expect("tempdir");
    let store = ProcessingStore::open(dir.path().join("catalog.redb"), StoreConfig::default())
        .expect("open");
    (dir, store)
}

fn node(i: u8) -> Entity {
    Entity::new("tessera.io/v1alpha1", "Location", format!("n{i}"))
}

fn nodes(set: &BTreeSet<u8>) -> Vec<Entity> {
    set.iter().copied().map(node).collect()
}

fn full(source_key: &str, items: Vec<Entity>) -> ReplaceUnprocessedEntities {
    ReplaceUnprocessedEntities::Full {
        source_key: source_key.to_string(),
        items,
    }
}

fn snapshot(store: &ProcessingStore) -> (Vec<(String, EntityRef)>, Vec<RefreshStateReference>) {
    let rows = store
        .refresh_states()
        .expect("states")
        .into_iter()
        .map(|r| (r.entity_id, r.entity_ref))
        .collect();
    (rows, store.references().expect("refs"))
}

/// Claim `p0`/`p1` sets, then let existing nodes defer their children.
/// Children of a node that does not exist yet are skipped.
fn build(store: &ProcessingStore, p0: &BTreeSet<u8>, p1: &BTreeSet<u8>, defers: &[(u8, BTreeSet<u8>)]) {
    store
        .transaction(|tx| {
            tx.replace_unprocessed_entities(full("p0", nodes(p0)))?;
            tx.replace_unprocessed_entities(full("p1", nodes(p1)))
        })
        .expect("claims");
    for (parent, children) in defers {
        let Some(row) = store.refresh_state(&node(*parent).entity_ref()).expect("read") else {
            continue;
        };
        store
            .transaction(|tx| {
                tx.update_processed_entity(ProcessedEntityUpdate {
                    id: row.entity_id.clone(),
                    processed_entity: node(*parent),
                    state: None,
                    relations: Vec::new(),
                    deferred_entities: nodes(children),
                    errors: Vec::new(),
                })
            })
            .expect("defer");
    }
}

/// Refs reachable from any provider edge.
fn reachable(edges: &[RefreshStateReference]) -> BTreeSet<EntityRef> {
    let mut children: BTreeMap<&EntityRef, Vec<&EntityRef>> = BTreeMap::new();
    let mut worklist = Vec::new();
    for edge in edges {
        match &edge.source {
            ReferenceSource::Provider(_) => worklist.push(&edge.target),
            ReferenceSource::Entity(source) => children.entry(source).or_default().push(&edge.target),
        }
    }
    let mut seen = BTreeSet::new();
    while let Some(next) = worklist.pop() {
        if seen.insert(next.clone()) {
            worklist.extend(children.get(next).into_iter().flatten().copied());
        }
    }
    seen
}

fn node_set() -> impl Strategy<Value = BTreeSet<u8>> {
    btree_set(0..NODES, 0..5)
}

fn deferrals() -> impl Strategy<Value = Vec<(u8, BTreeSet<u8>)>> {
    vec((0..NODES, btree_set(0..NODES, 0..3)), 0..10)
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Submitting the same full set twice leaves the graph unchanged.
    #[test]
    fn full_mutation_is_idempotent(p0 in node_set(), p1 in node_set(), defers in deferrals()) {
        let (_dir, store) = open_store();
        build(&store, &p0, &p1, &defers);
        let before = snapshot(&store);

        let report = store
            .transaction(|tx| tx.replace_unprocessed_entities(full("p0", nodes(&p0))))
            .expect("again");
        prop_assert!(report.created.is_empty());
        prop_assert!(report.pruned.deleted.is_empty());
        prop_assert_eq!(snapshot(&store), before);
    }

    /// A delta add followed by the matching delta remove is a no-op.
    #[test]
    fn delta_add_remove_is_symmetric(p0 in node_set(), p1 in node_set(), defers in deferrals(), extra in NODES..NODES + 4) {
        let (_dir, store) = open_store();
        build(&store, &p0, &p1, &defers);
        let before = snapshot(&store);

        let added = node(extra);
        store
            .transaction(|tx| tx.replace_unprocessed_entities(ReplaceUnprocessedEntities::Delta {
                source_key: "p0".to_string(),
                added: vec![added.clone()],
                removed: Vec::new(),
            }))
            .expect("add");
        store
            .transaction(|tx| tx.replace_unprocessed_entities(ReplaceUnprocessedEntities::Delta {
                source_key: "p0".to_string(),
                added: Vec::new(),
                removed: vec![added.entity_ref()],
            }))
            .expect("remove");
        prop_assert_eq!(snapshot(&store), before);
    }

    /// After any replacement, the stored nodes are exactly the nodes
    /// reachable from a provider edge, and every edge joins stored nodes.
    #[test]
    fn only_reachable_nodes_survive(
        p0 in node_set(),
        p1 in node_set(),
        defers in deferrals(),
        replacement in node_set(),
    ) {
        let (_dir, store) = open_store();
        build(&store, &p0, &p1, &defers);
        store
            .transaction(|tx| tx.replace_unprocessed_entities(full("p0", nodes(&replacement))))
            .expect("replace");

        let (rows, edges) = snapshot(&store);
        let stored: BTreeSet<EntityRef> = rows.into_iter().map(|(_, r)| r).collect();
        prop_assert_eq!(&stored, &reachable(&edges));
        for edge in &edges {
            prop_assert!(stored.contains(&edge.target));
            if let ReferenceSource::Entity(source) = &edge.source {
                prop_assert!(stored.contains(source));
            }
        }
    }

    /// Dropping one provider never removes a node the other still claims.
    #[test]
    fn shared_claims_are_retained(p0 in node_set(), p1 in node_set(), defers in deferrals()) {
        let (_dir, store) = open_store();
        build(&store, &p0, &p1, &defers);
        store
            .transaction(|tx| tx.replace_unprocessed_entities(full("p0", Vec::new())))
            .expect("drop p0");
        for i in &p1 {
            prop_assert!(store.refresh_state(&node(*i).entity_ref()).expect("read").is_some());
        }
    }
}
