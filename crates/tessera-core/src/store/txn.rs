//! # Store Transaction
//!
//! The processing operations. A [`StoreTxn`] wraps one redb write
//! transaction plus the clock reading it was opened with; every timestamp
//! written through it uses that single reading.

use super::tables;
use super::{LocationRow, RefreshStateRow, RelationRow, StoreConfig};
use crate::gc::{self, PruneReport};
use crate::orchestrator::EntityRelationSpec;
use crate::{CatalogError, Entity, EntityRef, ProcessingError, ReferenceSource};
use chrono::{DateTime, TimeDelta, Utc};
use redb::WriteTransaction;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

// =============================================================================
// OPERATION TYPES
// =============================================================================

/// A provider's claim change, applied by
/// [`StoreTxn::replace_unprocessed_entities`].
#[derive(Debug, Clone)]
pub enum ReplaceUnprocessedEntities {
    /// `items` is now the complete set claimed by `source_key`.
    Full {
        source_key: String,
        items: Vec<Entity>,
    },
    /// Add and drop individual claims of `source_key`.
    Delta {
        source_key: String,
        added: Vec<Entity>,
        removed: Vec<EntityRef>,
    },
}

/// Outcome of a claim replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceReport {
    /// Refs that got a new refresh state row.
    pub created: Vec<EntityRef>,
    /// Number of root edges removed.
    pub removed_claims: usize,
    pub pruned: PruneReport,
}

/// A claimed work item.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessableEntity {
    pub entity_id: String,
    pub entity_ref: EntityRef,
    pub unprocessed_entity: Entity,
    pub state: Option<JsonValue>,
}

/// The result of a successful processing pass.
#[derive(Debug, Clone)]
pub struct ProcessedEntityUpdate {
    pub id: String,
    pub processed_entity: Entity,
    pub state: Option<JsonValue>,
    pub relations: Vec<EntityRelationSpec>,
    pub deferred_entities: Vec<Entity>,
    pub errors: Vec<ProcessingError>,
}

fn state_not_found(id: &str) -> CatalogError {
    CatalogError::NotFound(format!("Processing state not found for {id}"))
}

// =============================================================================
// TRANSACTION
// =============================================================================

/// One unit of work against the processing store.
pub struct StoreTxn<'s> {
    txn: WriteTransaction,
    now: DateTime<Utc>,
    config: &'s StoreConfig,
}

impl<'s> StoreTxn<'s> {
    pub(super) fn new(txn: WriteTransaction, now: DateTime<Utc>, config: &'s StoreConfig) -> Self {
        Self { txn, now, config }
    }

    pub(super) fn commit(self) -> Result<(), CatalogError> {
        self.txn.commit()?;
        Ok(())
    }

    pub(super) fn abort(self) -> Result<(), CatalogError> {
        self.txn.abort()?;
        Ok(())
    }

    /// The clock reading of this transaction.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn after(&self, delay: Duration) -> DateTime<Utc> {
        let delta = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        self.now
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    // =========================================================================
    // CLAIMS
    // =========================================================================

    /// Apply a provider's claim change and prune whatever became unreachable.
    pub fn replace_unprocessed_entities(
        &mut self,
        mutation: ReplaceUnprocessedEntities,
    ) -> Result<ReplaceReport, CatalogError> {
        let mut report = ReplaceReport::default();
        let mut candidates = BTreeSet::new();

        let (source, existing, added) = match mutation {
            ReplaceUnprocessedEntities::Full { source_key, items } => {
                let source = ReferenceSource::Provider(source_key);
                let existing: BTreeSet<EntityRef> =
                    tables::edge_targets(&self.txn, &source)?.into_iter().collect();
                let added = by_ref(items);
                for stale in existing.iter().filter(|r| !added.contains_key(*r)) {
                    if tables::remove_edge(&self.txn, &source, stale.as_str())? {
                        report.removed_claims += 1;
                        candidates.insert(stale.clone());
                    }
                }
                (source, existing, added)
            }
            ReplaceUnprocessedEntities::Delta {
                source_key,
                added,
                removed,
            } => {
                let source = ReferenceSource::Provider(source_key);
                for entity_ref in removed {
                    if tables::remove_edge(&self.txn, &source, entity_ref.as_str())? {
                        report.removed_claims += 1;
                        candidates.insert(entity_ref);
                    }
                }
                let existing: BTreeSet<EntityRef> =
                    tables::edge_targets(&self.txn, &source)?.into_iter().collect();
                (source, existing, by_ref(added))
            }
        };

        for (entity_ref, entity) in &added {
            if self.upsert_unprocessed(entity_ref, entity)? {
                report.created.push(entity_ref.clone());
            }
            if !existing.contains(entity_ref) {
                tables::insert_edge(&self.txn, &source, entity_ref.as_str())?;
            }
        }

        report.pruned = gc::prune_unreachable(&self.txn, candidates)?;
        Ok(report)
    }

    /// Insert or refresh the unprocessed form of one entity. Returns whether
    /// a new row was created.
    fn upsert_unprocessed(&self, entity_ref: &EntityRef, entity: &Entity) -> Result<bool, CatalogError> {
        let json = entity.to_canonical_json()?;
        match tables::read_state(&self.txn, entity_ref.as_str())? {
            None => {
                let row = RefreshStateRow {
                    entity_id: uuid::Uuid::new_v4().to_string(),
                    entity_ref: entity_ref.clone(),
                    unprocessed_entity: json,
                    processed_entity: None,
                    cache: None,
                    errors: Vec::new(),
                    next_update_at: self.now,
                    last_discovery_at: self.now,
                };
                tables::put_state(&self.txn, &row, None)?;
                Ok(true)
            }
            Some(previous) => {
                let mut row = previous.clone();
                row.last_discovery_at = self.now;
                if row.unprocessed_entity != json {
                    row.unprocessed_entity = json;
                    row.next_update_at = self.now;
                }
                tables::put_state(&self.txn, &row, Some(&previous))?;
                Ok(false)
            }
        }
    }

    // =========================================================================
    // PROCESSING
    // =========================================================================

    /// Claim up to `batch_size` due rows, pushing each one's
    /// `next_update_at` out by the lease duration.
    pub fn get_processable_entities(
        &mut self,
        batch_size: usize,
    ) -> Result<Vec<ProcessableEntity>, CatalogError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let lease_until = self.after(self.config.lease_duration);
        let due = tables::due_refs(&self.txn, self.now.timestamp_millis(), batch_size)?;

        let mut items = Vec::with_capacity(due.len());
        for entity_ref in due {
            let Some(previous) = tables::read_state(&self.txn, &entity_ref)? else {
                continue;
            };
            let mut row = previous.clone();
            row.next_update_at = lease_until;
            tables::put_state(&self.txn, &row, Some(&previous))?;
            items.push(ProcessableEntity {
                unprocessed_entity: row.unprocessed()?,
                state: row.state()?,
                entity_id: row.entity_id,
                entity_ref: row.entity_ref,
            });
        }
        Ok(items)
    }

    /// Persist a successful processing pass.
    ///
    /// Replaces the relations originated by the entity and folds the
    /// deferred entities into the reference graph as edges sourced by it.
    /// Deferred entities dropped since the last pass lose their edge and are
    /// pruned if nothing else reaches them. The returned report also lists
    /// the endpoints of relations that were dropped.
    pub fn update_processed_entity(
        &mut self,
        update: ProcessedEntityUpdate,
    ) -> Result<PruneReport, CatalogError> {
        let id = update.id.as_str();
        let entity_ref = tables::read_state_ref_by_id(&self.txn, id)?
            .ok_or_else(|| state_not_found(id))?;
        let previous = tables::read_state(&self.txn, &entity_ref)?.ok_or_else(|| state_not_found(id))?;
        let entity_ref = previous.entity_ref.clone();

        let mut row = previous.clone();
        row.processed_entity = Some(update.processed_entity.to_canonical_json()?);
        row.cache = update
            .state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        row.errors = update.errors;
        row.next_update_at = self.after(self.config.refresh_interval);
        tables::put_state(&self.txn, &row, Some(&previous))?;

        let relations: BTreeSet<RelationRow> = update
            .relations
            .iter()
            .map(|spec| RelationRow {
                originating_entity_id: id.to_string(),
                source: spec.source.to_ref(),
                relation_type: spec.relation_type.clone(),
                target: spec.target.to_ref(),
            })
            .collect();
        let dropped: Vec<RelationRow> = tables::delete_relations_from(&self.txn, id)?
            .into_iter()
            .filter(|rel| !relations.contains(rel))
            .collect();
        for relation in &relations {
            tables::insert_relation(&self.txn, relation)?;
        }

        let source = ReferenceSource::Entity(entity_ref.clone());
        let existing: BTreeSet<EntityRef> =
            tables::edge_targets(&self.txn, &source)?.into_iter().collect();
        let mut deferred = by_ref(update.deferred_entities);
        deferred.remove(&entity_ref);

        let mut candidates = BTreeSet::new();
        for stale in existing.iter().filter(|r| !deferred.contains_key(*r)) {
            tables::remove_edge(&self.txn, &source, stale.as_str())?;
            candidates.insert(stale.clone());
        }
        for (target, entity) in &deferred {
            self.upsert_unprocessed(target, entity)?;
            if !existing.contains(target) {
                tables::insert_edge(&self.txn, &source, target.as_str())?;
            }
        }

        let mut report = gc::prune_unreachable(&self.txn, candidates)?;
        for relation in dropped {
            report.restitch.insert(relation.source);
            report.restitch.insert(relation.target);
        }
        report.restitch.remove(&entity_ref);
        let deleted = &report.deleted;
        report.restitch.retain(|r| !deleted.contains(r));
        Ok(report)
    }

    /// Record a failed processing pass. The processed entity and its
    /// relations are left as they were.
    pub fn update_processed_entity_errors(
        &mut self,
        id: &str,
        errors: Vec<ProcessingError>,
    ) -> Result<(), CatalogError> {
        let entity_ref = tables::read_state_ref_by_id(&self.txn, id)?
            .ok_or_else(|| state_not_found(id))?;
        let previous = tables::read_state(&self.txn, &entity_ref)?.ok_or_else(|| state_not_found(id))?;
        let mut row = previous.clone();
        row.errors = errors;
        row.next_update_at = self.after(self.config.refresh_interval);
        tables::put_state(&self.txn, &row, Some(&previous))
    }

    // =========================================================================
    // LOCATIONS
    // =========================================================================

    /// Register a location. A second registration of the same
    /// `(type, target)` pair is a conflict.
    pub fn add_location(&mut self, location_type: &str, target: &str) -> Result<LocationRow, CatalogError> {
        let existing = {
            let table = self.txn.open_table(tables::LOCATIONS)?;
            tables::all_locations(&table)?
        };
        if existing
            .iter()
            .any(|l| l.location_type == location_type && l.target == target)
        {
            return Err(CatalogError::Conflict(format!(
                "Location {location_type}:{target} already exists"
            )));
        }
        let row = LocationRow {
            id: uuid::Uuid::new_v4().to_string(),
            location_type: location_type.to_string(),
            target: target.to_string(),
        };
        tables::put_location(&self.txn, &row)?;
        Ok(row)
    }

    pub fn remove_location(&mut self, id: &str) -> Result<LocationRow, CatalogError> {
        tables::delete_location(&self.txn, id)?
            .ok_or_else(|| CatalogError::NotFound(format!("Location {id} not found")))
    }
}

/// Key entities by ref; the last occurrence of a ref wins.
fn by_ref(entities: Vec<Entity>) -> BTreeMap<EntityRef, Entity> {
    entities.into_iter().map(|e| (e.entity_ref(), e)).collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::store::ProcessingStore;
    use chrono::TimeZone;
    use tempfile::{TempDir, tempdir};

    fn open_store() -> (TempDir, ProcessingStore) {
        let dir = tempdir().expect("tempdir");
        let store = ProcessingStore::open(dir.path().join("catalog.redb"), StoreConfig::default())
            .expect("open");
        (dir, store)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid time")
    }

    fn component(name: &str) -> Entity {
        Entity::new("tessera.io/v1alpha1", "Component", name)
    }

    #[test]
    fn upsert_keeps_id_and_refreshes_discovery() {
        let (_dir, store) = open_store();
        let full = |items| ReplaceUnprocessedEntities::Full {
            source_key: "p".to_string(),
            items,
        };
        let report = store
            .transaction_at(at(0), |tx| tx.replace_unprocessed_entities(full(vec![component("a")])))
            .expect("first");
        assert_eq!(report.created.len(), 1);

        let a = EntityRef::new("component", "default", "a");
        let first = store.refresh_state(&a).expect("read").expect("row");
        assert_eq!(first.next_update_at, at(0));

        let report = store
            .transaction_at(at(5), |tx| tx.replace_unprocessed_entities(full(vec![component("a")])))
            .expect("second");
        assert!(report.created.is_empty());
        let second = store.refresh_state(&a).expect("read").expect("row");
        assert_eq!(second.entity_id, first.entity_id);
        assert_eq!(second.last_discovery_at, at(5));
        assert_eq!(second.next_update_at, at(0));
    }

    #[test]
    fn changed_content_is_rescheduled() {
        let (_dir, store) = open_store();
        let a = EntityRef::new("component", "default", "a");
        store
            .transaction_at(at(0), |tx| {
                tx.replace_unprocessed_entities(ReplaceUnprocessedEntities::Full {
                    source_key: "p".to_string(),
                    items: vec![component("a")],
                })?;
                tx.get_processable_entities(1)
            })
            .expect("claim");
        let claimed = store.refresh_state(&a).expect("read").expect("row");
        assert_eq!(claimed.next_update_at, at(10));

        let changed = component("a").with_spec(serde_json::json!({ "type": "service" }));
        store
            .transaction_at(at(2), |tx| {
                tx.replace_unprocessed_entities(ReplaceUnprocessedEntities::Full {
                    source_key: "p".to_string(),
                    items: vec![changed],
                })
            })
            .expect("replace");
        let row = store.refresh_state(&a).expect("read").expect("row");
        assert_eq!(row.next_update_at, at(2));
        assert!(row.unprocessed_entity.contains("service"));
    }

    #[test]
    fn claims_only_due_rows_and_not_twice() {
        let (_dir, store) = open_store();
        store
            .transaction_at(at(0), |tx| {
                tx.replace_unprocessed_entities(ReplaceUnprocessedEntities::Full {
                    source_key: "p".to_string(),
                    items: vec![component("a"), component("b")],
                })
            })
            .expect("replace");

        let first = store
            .transaction_at(at(1), |tx| tx.get_processable_entities(1))
            .expect("claim");
        let second = store
            .transaction_at(at(1), |tx| tx.get_processable_entities(5))
            .expect("claim");
        let third = store
            .transaction_at(at(1), |tx| tx.get_processable_entities(5))
            .expect("claim");
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());
        assert_ne!(first[0].entity_id, second[0].entity_id);

        let expired = store
            .transaction_at(at(11), |tx| tx.get_processable_entities(5))
            .expect("claim after lease");
        assert_eq!(expired.len(), 2);
    }

    #[test]
    fn zero_batch_claims_nothing() {
        let (_dir, store) = open_store();
        store
            .transaction_at(at(0), |tx| {
                tx.replace_unprocessed_entities(ReplaceUnprocessedEntities::Full {
                    source_key: "p".to_string(),
                    items: vec![component("a")],
                })
            })
            .expect("replace");
        let items = store
            .transaction_at(at(1), |tx| tx.get_processable_entities(0))
            .expect("claim");
        assert!(items.is_empty());
    }

    #[test]
    fn update_unknown_id_is_not_found() {
        let (_dir, store) = open_store();
        let err = store
            .transaction(|tx| {
                tx.update_processed_entity(ProcessedEntityUpdate {
                    id: "missing".to_string(),
                    processed_entity: component("a"),
                    state: None,
                    relations: Vec::new(),
                    deferred_entities: Vec::new(),
                    errors: Vec::new(),
                })
            })
            .expect_err("unknown id");
        assert_eq!(err.to_string(), "Processing state not found for missing");

        let err = store
            .transaction(|tx| tx.update_processed_entity_errors("missing", Vec::new()))
            .expect_err("unknown id");
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[test]
    fn errors_update_keeps_processed_entity() {
        let (_dir, store) = open_store();
        let items = store
            .transaction_at(at(0), |tx| {
                tx.replace_unprocessed_entities(ReplaceUnprocessedEntities::Full {
                    source_key: "p".to_string(),
                    items: vec![component("a")],
                })?;
                tx.get_processable_entities(1)
            })
            .expect("claim");
        let id = items[0].entity_id.clone();
        store
            .transaction_at(at(1), |tx| {
                tx.update_processed_entity(ProcessedEntityUpdate {
                    id: id.clone(),
                    processed_entity: component("a"),
                    state: Some(serde_json::json!({ "k": 1 })),
                    relations: Vec::new(),
                    deferred_entities: Vec::new(),
                    errors: Vec::new(),
                })
            })
            .expect("update");
        store
            .transaction_at(at(2), |tx| {
                tx.update_processed_entity_errors(&id, vec![ProcessingError::new("InputError", "boom")])
            })
            .expect("errors");

        let row = store.refresh_state_by_id(&id).expect("read").expect("row");
        assert!(row.processed_entity.is_some());
        assert_eq!(row.errors.len(), 1);
        assert_eq!(row.state().expect("state"), Some(serde_json::json!({ "k": 1 })));
        assert_eq!(row.next_update_at, at(102));
    }

    #[test]
    fn self_deferral_is_ignored() {
        let (_dir, store) = open_store();
        let items = store
            .transaction_at(at(0), |tx| {
                tx.replace_unprocessed_entities(ReplaceUnprocessedEntities::Full {
                    source_key: "p".to_string(),
                    items: vec![component("a")],
                })?;
                tx.get_processable_entities(1)
            })
            .expect("claim");
        store
            .transaction_at(at(1), |tx| {
                tx.update_processed_entity(ProcessedEntityUpdate {
                    id: items[0].entity_id.clone(),
                    processed_entity: component("a"),
                    state: None,
                    relations: Vec::new(),
                    deferred_entities: vec![component("a")],
                    errors: Vec::new(),
                })
            })
            .expect("update");
        assert_eq!(store.references().expect("refs").len(), 1);
    }

    #[test]
    fn locations_reject_duplicates() {
        let (_dir, store) = open_store();
        let row = store
            .transaction(|tx| tx.add_location("file", "catalog.yaml"))
            .expect("add");
        let err = store
            .transaction(|tx| tx.add_location("file", "catalog.yaml"))
            .expect_err("duplicate");
        assert!(matches!(err, CatalogError::Conflict(_)));
        assert_eq!(store.locations().expect("list"), vec![row.clone()]);

        let removed = store
            .transaction(|tx| tx.remove_location(&row.id))
            .expect("remove");
        assert_eq!(removed, row);
        let err = store
            .transaction(|tx| tx.remove_location(&row.id))
            .expect_err("gone");
        assert!(matches!(err, CatalogError::NotFound(_)));
    }
}
