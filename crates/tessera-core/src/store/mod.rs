//! # Processing Store
//!
//! Durable processing state of the catalog, backed by redb:
//! - refresh state rows (unprocessed/processed entity, cache, errors, schedule)
//! - the reference graph (root and entity-sourced edges)
//! - relations, keyed by the entity that asserted them
//! - final (stitched) entities and their search index
//! - registered locations
//!
//! Every mutation happens inside [`ProcessingStore::transaction`], which
//! maps one closure onto one redb write transaction: `Ok` commits, `Err`
//! aborts. redb serializes writers, so a claim made by one transaction is
//! always visible to the next one.

pub(crate) mod tables;
mod txn;

pub use txn::{
    ProcessableEntity, ProcessedEntityUpdate, ReplaceReport, ReplaceUnprocessedEntities, StoreTxn,
};

use crate::primitives::{DEFAULT_LEASE_DURATION, DEFAULT_REFRESH_INTERVAL};
use crate::{CatalogError, Entity, EntityRef, ProcessingError, RefreshStateReference};
use chrono::{DateTime, SubsecRound, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Scheduling knobs of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// How far a claim pushes `next_update_at` into the future.
    pub lease_duration: Duration,
    /// Delay before an entity is processed again after a pass.
    pub refresh_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    #[must_use]
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }
}

// =============================================================================
// ROWS
// =============================================================================

/// Processing state of one known entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshStateRow {
    /// Stable internal id, issued when the ref is first seen.
    pub entity_id: String,
    pub entity_ref: EntityRef,
    /// Canonical JSON as submitted.
    pub unprocessed_entity: String,
    /// Canonical JSON of the last successful pass.
    pub processed_entity: Option<String>,
    /// Processor state carried across passes (JSON).
    pub cache: Option<String>,
    pub errors: Vec<ProcessingError>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub next_update_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_discovery_at: DateTime<Utc>,
}

impl RefreshStateRow {
    pub fn unprocessed(&self) -> Result<Entity, CatalogError> {
        Entity::from_json(&self.unprocessed_entity)
    }

    pub fn processed(&self) -> Result<Option<Entity>, CatalogError> {
        self.processed_entity
            .as_deref()
            .map(Entity::from_json)
            .transpose()
    }

    pub fn state(&self) -> Result<Option<JsonValue>, CatalogError> {
        match self.cache.as_deref() {
            Some(cache) => Ok(Some(serde_json::from_str(cache)?)),
            None => Ok(None),
        }
    }
}

/// A typed relation owned by the entity that asserted it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationRow {
    pub originating_entity_id: String,
    pub source: EntityRef,
    pub relation_type: String,
    pub target: EntityRef,
}

impl RelationRow {
    pub(crate) fn from_parts(origin: &str, source: &str, relation_type: &str, target: &str) -> Self {
        Self {
            originating_entity_id: origin.to_string(),
            source: EntityRef::from_canonical(source),
            relation_type: relation_type.to_string(),
            target: EntityRef::from_canonical(target),
        }
    }
}

/// The materialized public view of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalEntityRow {
    pub entity_id: String,
    pub entity_ref: EntityRef,
    /// blake3 hex digest of `final_entity`; empty until the first commit.
    pub hash: String,
    pub stitch_ticket: u64,
    pub final_entity: Option<String>,
}

impl FinalEntityRow {
    pub fn entity(&self) -> Result<Option<Entity>, CatalogError> {
        self.final_entity
            .as_deref()
            .map(Entity::from_json)
            .transpose()
    }
}

/// A registered location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRow {
    pub id: String,
    #[serde(rename = "type")]
    pub location_type: String,
    pub target: String,
}

/// Row counts of every table family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub refresh_states: u64,
    pub references: u64,
    pub relations: u64,
    pub final_entities: u64,
    pub search_rows: u64,
    pub locations: u64,
}

// =============================================================================
// STORE
// =============================================================================

/// The processing store.
pub struct ProcessingStore {
    db: Database,
    config: StoreConfig,
}

impl std::fmt::Debug for ProcessingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProcessingStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, CatalogError> {
        let db = Database::create(path.as_ref())?;
        let write_txn = db.begin_write()?;
        tables::create_all(&write_txn)?;
        write_txn.commit()?;
        Ok(Self { db, config })
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    /// Run `f` in one write transaction stamped with the wall clock.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut StoreTxn<'_>) -> Result<T, CatalogError>,
    ) -> Result<T, CatalogError> {
        self.transaction_at(Utc::now(), f)
    }

    /// Run `f` in one write transaction whose clock reads `now`.
    ///
    /// Timestamps are stored with millisecond precision, so `now` is
    /// truncated to whole milliseconds first.
    pub fn transaction_at<T>(
        &self,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut StoreTxn<'_>) -> Result<T, CatalogError>,
    ) -> Result<T, CatalogError> {
        let mut tx = StoreTxn::new(self.db.begin_write()?, now.trunc_subsecs(3), &self.config);
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.abort();
                Err(e)
            }
        }
    }

    // =========================================================================
    // READ ACCESSORS
    // =========================================================================

    pub fn refresh_state(&self, entity_ref: &EntityRef) -> Result<Option<RefreshStateRow>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::REFRESH_STATE)?;
        tables::get_state(&table, entity_ref.as_str())
    }

    pub fn refresh_state_by_id(&self, entity_id: &str) -> Result<Option<RefreshStateRow>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let ids = read_txn.open_table(tables::REFRESH_STATE_IDS)?;
        let Some(entity_ref) = ids.get(entity_id)?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };
        let table = read_txn.open_table(tables::REFRESH_STATE)?;
        tables::get_state(&table, &entity_ref)
    }

    /// Every refresh state row, ordered by ref.
    pub fn refresh_states(&self) -> Result<Vec<RefreshStateRow>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::REFRESH_STATE)?;
        tables::all_states(&table)
    }

    /// Every reference graph edge, provider edges first.
    pub fn references(&self) -> Result<Vec<RefreshStateReference>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::REFS_BY_SOURCE)?;
        tables::all_edges(&table)
    }

    pub fn relations(&self) -> Result<Vec<RelationRow>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::RELATIONS_BY_ORIGIN)?;
        tables::all_relations(&table)
    }

    pub fn relations_originated_by(&self, entity_id: &str) -> Result<Vec<RelationRow>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::RELATIONS_BY_ORIGIN)?;
        tables::relations_from_origin(&table, entity_id)
    }

    /// The final row of an entity, looked up through its refresh state.
    pub fn final_entity(&self, entity_ref: &EntityRef) -> Result<Option<FinalEntityRow>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let states = read_txn.open_table(tables::REFRESH_STATE)?;
        let Some(state) = tables::get_state(&states, entity_ref.as_str())? else {
            return Ok(None);
        };
        let finals = read_txn.open_table(tables::FINAL_ENTITIES)?;
        tables::get_final(&finals, &state.entity_id)
    }

    pub fn final_entities(&self) -> Result<Vec<FinalEntityRow>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::FINAL_ENTITIES)?;
        tables::all_finals(&table)
    }

    /// Final entities indexed under `key = value`. Both sides are matched
    /// case-insensitively.
    pub fn search(&self, key: &str, value: &str) -> Result<Vec<FinalEntityRow>, CatalogError> {
        let key = key.to_lowercase();
        let value = value.to_lowercase();
        let read_txn = self.db.begin_read()?;
        let search = read_txn.open_table(tables::SEARCH)?;
        let finals = read_txn.open_table(tables::FINAL_ENTITIES)?;
        let mut rows = Vec::new();
        for id in tables::search_ids(&search, &key, &value)? {
            if let Some(row) = tables::get_final(&finals, &id)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// The search rows of one entity, ordered by key.
    pub fn search_index(&self, entity_ref: &EntityRef) -> Result<Vec<(String, String)>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let states = read_txn.open_table(tables::REFRESH_STATE)?;
        let Some(state) = tables::get_state(&states, entity_ref.as_str())? else {
            return Ok(Vec::new());
        };
        let table = read_txn.open_table(tables::SEARCH_BY_ENTITY)?;
        tables::search_rows_of(&table, &state.entity_id)
    }

    pub fn locations(&self) -> Result<Vec<LocationRow>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::LOCATIONS)?;
        tables::all_locations(&table)
    }

    pub fn stats(&self) -> Result<StoreStats, CatalogError> {
        let read_txn = self.db.begin_read()?;
        Ok(StoreStats {
            refresh_states: read_txn.open_table(tables::REFRESH_STATE)?.len()?,
            references: read_txn.open_table(tables::REFS_BY_SOURCE)?.len()?,
            relations: read_txn.open_table(tables::RELATIONS_BY_ORIGIN)?.len()?,
            final_entities: read_txn.open_table(tables::FINAL_ENTITIES)?.len()?,
            search_rows: read_txn.open_table(tables::SEARCH)?.len()?,
            locations: read_txn.open_table(tables::LOCATIONS)?.len()?,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
