//! # Reference Graph GC
//!
//! Reachability pruning of the reference graph.
//!
//! An entity exists only while some path of edges leads to it from a
//! provider's root edge. After edges are removed, [`prune_unreachable`]
//! deletes every entity that lost its last such path, transitively, inside
//! the caller's write transaction.
//!
//! ## Algorithm
//!
//! 1. `affected` = the candidates plus everything reachable from them along
//!    entity-sourced edges. Only these nodes can have lost a path.
//! 2. Seeds = affected nodes that still have a root edge, or an incoming
//!    edge from an entity outside `affected` (such entities are untouched
//!    and keep all their paths).
//! 3. Liveness spreads from the seeds along edges that stay inside
//!    `affected`.
//! 4. Every affected node that is not live is deleted.
//!
//! Both walks use an explicit worklist and visited set, so cycles terminate
//! and no node is visited twice.

use crate::store::tables;
use crate::{CatalogError, EntityRef, ReferenceSource};
use redb::WriteTransaction;
use std::collections::BTreeSet;

/// What a pruning pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Entities whose refresh state was deleted.
    pub deleted: BTreeSet<EntityRef>,
    /// Surviving entities whose stitched view referenced a deleted one
    /// through a relation and should be stitched again.
    pub restitch: BTreeSet<EntityRef>,
}

impl PruneReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.restitch.is_empty()
    }
}

/// Delete every candidate (and descendant) that is no longer reachable from
/// a root edge.
pub(crate) fn prune_unreachable(
    txn: &WriteTransaction,
    candidates: BTreeSet<EntityRef>,
) -> Result<PruneReport, CatalogError> {
    let mut report = PruneReport::default();
    if candidates.is_empty() {
        return Ok(report);
    }

    let affected = descendants(txn, candidates)?;
    let live = live_nodes(txn, &affected)?;

    for node in affected.difference(&live) {
        purge(txn, node, &mut report)?;
    }
    let deleted = &report.deleted;
    report.restitch.retain(|r| !deleted.contains(r));
    Ok(report)
}

fn descendants(
    txn: &WriteTransaction,
    candidates: BTreeSet<EntityRef>,
) -> Result<BTreeSet<EntityRef>, CatalogError> {
    let mut visited = BTreeSet::new();
    let mut worklist: Vec<EntityRef> = candidates.into_iter().collect();
    while let Some(node) = worklist.pop() {
        if visited.contains(&node) {
            continue;
        }
        let children = tables::edge_targets(txn, &ReferenceSource::Entity(node.clone()))?;
        worklist.extend(children.into_iter().filter(|c| !visited.contains(c)));
        visited.insert(node);
    }
    Ok(visited)
}

fn live_nodes(
    txn: &WriteTransaction,
    affected: &BTreeSet<EntityRef>,
) -> Result<BTreeSet<EntityRef>, CatalogError> {
    let mut worklist = Vec::new();
    for node in affected {
        let anchored = tables::edge_sources(txn, node.as_str())?
            .iter()
            .any(|source| match source {
                ReferenceSource::Provider(_) => true,
                ReferenceSource::Entity(parent) => !affected.contains(parent),
            });
        if anchored {
            worklist.push(node.clone());
        }
    }

    let mut live = BTreeSet::new();
    while let Some(node) = worklist.pop() {
        if live.contains(&node) {
            continue;
        }
        let children = tables::edge_targets(txn, &ReferenceSource::Entity(node.clone()))?;
        worklist.extend(
            children
                .into_iter()
                .filter(|c| affected.contains(c) && !live.contains(c)),
        );
        live.insert(node);
    }
    Ok(live)
}

/// Remove one entity: its edges in both directions, its refresh state, the
/// relations it originated and its final entity.
fn purge(
    txn: &WriteTransaction,
    node: &EntityRef,
    report: &mut PruneReport,
) -> Result<(), CatalogError> {
    let as_source = ReferenceSource::Entity(node.clone());
    for target in tables::edge_targets(txn, &as_source)? {
        tables::remove_edge(txn, &as_source, target.as_str())?;
    }
    for source in tables::edge_sources(txn, node.as_str())? {
        tables::remove_edge(txn, &source, node.as_str())?;
    }
    if let Some(row) = tables::delete_state(txn, node.as_str())? {
        for relation in tables::delete_relations_from(txn, &row.entity_id)? {
            report.restitch.insert(relation.source);
            report.restitch.insert(relation.target);
        }
        tables::delete_final(txn, &row.entity_id)?;
    }
    report.deleted.insert(node.clone());
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use crate::store::{ProcessedEntityUpdate, ProcessingStore, ReplaceUnprocessedEntities, StoreConfig};
    use crate::{Entity, EntityRef, ReferenceSource, RefreshStateReference};
    use tempfile::{TempDir, tempdir};

    fn open_store() -> (TempDir, ProcessingStore) {
        let dir = tempdir().expect("tempdir");
        let store = ProcessingStore::open(dir.path().join("catalog.redb"), StoreConfig::default())
            .expect("open");
        (dir, store)
    }

    fn location(name: &str) -> Entity {
        Entity::new("tessera.io/v1alpha1", "Location", name)
    }

    fn loc_ref(name: &str) -> EntityRef {
        EntityRef::new("location", "default", name)
    }

    fn full(source_key: &str, items: Vec<Entity>) -> ReplaceUnprocessedEntities {
        ReplaceUnprocessedEntities::Full {
            source_key: source_key.to_string(),
            items,
        }
    }

    /// Mark `parent` as processed with the given deferred children.
    fn defer(store: &ProcessingStore, parent: &str, children: &[&str]) {
        let row = store
            .refresh_state(&loc_ref(parent))
            .expect("read")
            .expect("parent exists");
        store
            .transaction(|tx| {
                tx.update_processed_entity(ProcessedEntityUpdate {
                    id: row.entity_id.clone(),
                    processed_entity: location(parent),
                    state: None,
                    relations: Vec::new(),
                    deferred_entities: children.iter().map(|c| location(c)).collect(),
                    errors: Vec::new(),
                })
            })
            .expect("update");
    }

    #[test]
    fn cycle_without_root_is_collected() {
        let (_dir, store) = open_store();
        store
            .transaction(|tx| tx.replace_unprocessed_entities(full("config", vec![location("a")])))
            .expect("claim");
        defer(&store, "a", &["b"]);
        defer(&store, "b", &["a"]);
        assert_eq!(store.refresh_states().expect("states").len(), 2);

        let report = store
            .transaction(|tx| tx.replace_unprocessed_entities(full("config", Vec::new())))
            .expect("drop");
        assert_eq!(report.pruned.deleted.len(), 2);
        assert!(store.refresh_states().expect("states").is_empty());
        assert!(store.references().expect("refs").is_empty());
    }

    #[test]
    fn cycle_with_outside_anchor_survives() {
        let (_dir, store) = open_store();
        store
            .transaction(|tx| {
                tx.replace_unprocessed_entities(full("config", vec![location("a")]))?;
                tx.replace_unprocessed_entities(full("other", vec![location("c")]))
            })
            .expect("claim");
        defer(&store, "a", &["b"]);
        defer(&store, "b", &["a"]);
        defer(&store, "c", &["b"]);

        let report = store
            .transaction(|tx| tx.replace_unprocessed_entities(full("config", Vec::new())))
            .expect("drop");
        assert!(report.pruned.deleted.is_empty());
        assert_eq!(store.refresh_states().expect("states").len(), 3);
        assert!(!store.references().expect("refs").contains(&RefreshStateReference {
            source: ReferenceSource::Provider("config".to_string()),
            target: loc_ref("a"),
        }));
    }

    #[test]
    fn dropping_a_deferred_child_prunes_its_subtree() {
        let (_dir, store) = open_store();
        store
            .transaction(|tx| tx.replace_unprocessed_entities(full("config", vec![location("a")])))
            .expect("claim");
        defer(&store, "a", &["b", "x"]);
        defer(&store, "b", &["c"]);
        defer(&store, "a", &["x"]);

        let refs: Vec<EntityRef> = store
            .refresh_states()
            .expect("states")
            .into_iter()
            .map(|r| r.entity_ref)
            .collect();
        assert_eq!(refs, vec![loc_ref("a"), loc_ref("x")]);
    }
}
