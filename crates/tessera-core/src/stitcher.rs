//! # Stitcher
//!
//! Materializes the public view of an entity: the processed entity plus its
//! outgoing and incoming relations and its current processing errors.
//!
//! Each ref is stitched in three short transactions:
//! 1. reserve: take the next ticket and record it on the final row
//! 2. compose: build the final entity from a read snapshot
//! 3. commit: write it only if the recorded ticket is still ours
//!
//! A stitch that loses the race to a later one is reported as
//! [`StitchOutcome::Superseded`]; the later stitch already covers it.

use crate::entity::{EntityRelation, EntityStatus, EntityStatusItem, IncomingRelation};
use crate::primitives::{
    DEFAULT_NAMESPACE, MAX_SEARCH_KEY_LENGTH, MAX_SEARCH_VALUE_LENGTH, PROCESSING_STATUS_TYPE,
};
use crate::store::{FinalEntityRow, ProcessingStore, tables};
use crate::{CatalogError, Entity, EntityRef};
use redb::ReadableDatabase;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Result of stitching one ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StitchOutcome {
    /// A new final entity was written.
    Committed,
    /// The composed entity hashed to the stored one.
    Unchanged,
    /// A newer stitch of the same ref took over.
    Superseded,
    /// The ref has no refresh state or was never processed.
    Skipped,
}

/// Per-outcome counts of a stitch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StitchReport {
    pub committed: usize,
    pub unchanged: usize,
    pub superseded: usize,
    pub skipped: usize,
}

impl StitchReport {
    fn record(&mut self, outcome: StitchOutcome) {
        match outcome {
            StitchOutcome::Committed => self.committed += 1,
            StitchOutcome::Unchanged => self.unchanged += 1,
            StitchOutcome::Superseded => self.superseded += 1,
            StitchOutcome::Skipped => self.skipped += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.committed + self.unchanged + self.superseded + self.skipped
    }
}

struct Composed {
    hash: String,
    final_entity: String,
    search: Vec<(String, String)>,
}

/// Rebuilds final entities from the processing store.
#[derive(Debug, Clone)]
pub struct Stitcher {
    store: Arc<ProcessingStore>,
}

impl Stitcher {
    #[must_use]
    pub fn new(store: Arc<ProcessingStore>) -> Self {
        Self { store }
    }

    /// Stitch every ref in the set. Refs are independent; the first storage
    /// error stops the run.
    pub fn stitch(&self, refs: &BTreeSet<EntityRef>) -> Result<StitchReport, CatalogError> {
        let mut report = StitchReport::default();
        for entity_ref in refs {
            report.record(self.stitch_one(entity_ref)?);
        }
        Ok(report)
    }

    pub fn stitch_one(&self, entity_ref: &EntityRef) -> Result<StitchOutcome, CatalogError> {
        let Some((entity_id, ticket)) = self.reserve(entity_ref)? else {
            return Ok(StitchOutcome::Skipped);
        };
        let Some(composed) = self.compose(entity_ref, &entity_id)? else {
            return Ok(StitchOutcome::Skipped);
        };
        self.commit(&entity_id, ticket, composed)
    }

    /// Phase 1.
    fn reserve(&self, entity_ref: &EntityRef) -> Result<Option<(String, u64)>, CatalogError> {
        let txn = self.store.db().begin_write()?;
        let state = match tables::read_state(&txn, entity_ref.as_str())? {
            Some(state) if state.processed_entity.is_some() => state,
            _ => {
                txn.abort()?;
                return Ok(None);
            }
        };
        let ticket = tables::next_ticket(&txn)?;
        let row = match tables::read_final(&txn, &state.entity_id)? {
            Some(existing) => FinalEntityRow {
                stitch_ticket: ticket,
                ..existing
            },
            None => FinalEntityRow {
                entity_id: state.entity_id.clone(),
                entity_ref: state.entity_ref.clone(),
                hash: String::new(),
                stitch_ticket: ticket,
                final_entity: None,
            },
        };
        tables::put_final(&txn, &row)?;
        txn.commit()?;
        Ok(Some((state.entity_id, ticket)))
    }

    /// Phase 2.
    fn compose(&self, entity_ref: &EntityRef, entity_id: &str) -> Result<Option<Composed>, CatalogError> {
        let read_txn = self.store.db().begin_read()?;
        let states = read_txn.open_table(tables::REFRESH_STATE)?;
        let Some(state) = tables::get_state(&states, entity_ref.as_str())? else {
            return Ok(None);
        };
        if state.entity_id != entity_id {
            return Ok(None);
        }
        let Some(mut entity) = state.processed()? else {
            return Ok(None);
        };

        let by_source = read_txn.open_table(tables::RELATIONS_BY_SOURCE)?;
        let by_target = read_txn.open_table(tables::RELATIONS_BY_TARGET)?;

        let outgoing: BTreeSet<EntityRelation> = tables::relations_with_source(&by_source, entity_ref.as_str())?
            .into_iter()
            .map(|r| EntityRelation {
                target: r.target.to_name(),
                target_ref: r.target,
                relation_type: r.relation_type,
            })
            .collect();
        let incoming: BTreeSet<IncomingRelation> = tables::relations_with_target(&by_target, entity_ref.as_str())?
            .into_iter()
            .map(|r| IncomingRelation {
                source: r.source.to_name(),
                source_ref: r.source,
                relation_type: r.relation_type,
            })
            .collect();

        entity.relations = outgoing.into_iter().collect();
        entity.incoming_relations = incoming.into_iter().collect();
        entity.status = if state.errors.is_empty() {
            None
        } else {
            Some(EntityStatus {
                items: state
                    .errors
                    .iter()
                    .map(|e| EntityStatusItem {
                        item_type: PROCESSING_STATUS_TYPE.to_string(),
                        level: "error".to_string(),
                        message: e.to_string(),
                        error: Some(e.clone()),
                    })
                    .collect(),
            })
        };
        entity.metadata.uid = Some(state.entity_id.clone());
        entity.metadata.etag = None;

        let hash = blake3::hash(entity.to_canonical_json()?.as_bytes())
            .to_hex()
            .to_string();
        entity.metadata.etag = Some(hash.clone());

        Ok(Some(Composed {
            hash,
            final_entity: entity.to_canonical_json()?,
            search: search_rows(&entity)?,
        }))
    }

    /// Phase 3.
    fn commit(&self, entity_id: &str, ticket: u64, composed: Composed) -> Result<StitchOutcome, CatalogError> {
        let txn = self.store.db().begin_write()?;
        let current = match tables::read_final(&txn, entity_id)? {
            Some(row) if row.stitch_ticket == ticket => row,
            _ => {
                txn.abort()?;
                return Ok(StitchOutcome::Superseded);
            }
        };
        if current.hash == composed.hash && current.final_entity.is_some() {
            txn.abort()?;
            return Ok(StitchOutcome::Unchanged);
        }
        tables::put_final(
            &txn,
            &FinalEntityRow {
                hash: composed.hash,
                final_entity: Some(composed.final_entity),
                ..current
            },
        )?;
        tables::replace_search(&txn, entity_id, &composed.search)?;
        txn.commit()?;
        Ok(StitchOutcome::Committed)
    }
}

// =============================================================================
// SEARCH INDEX
// =============================================================================

/// Flatten a final entity into lower-cased `(dotted.key, value)` rows.
///
/// Array elements share their parent's key. Relations are indexed as
/// `relations.<type>` pointing at the target ref.
fn search_rows(entity: &Entity) -> Result<Vec<(String, String)>, CatalogError> {
    let mut rows = BTreeSet::new();
    let mut value = serde_json::to_value(entity)?;
    if let JsonValue::Object(map) = &mut value {
        map.remove("relations");
        map.remove("incomingRelations");
        map.remove("status");
    }
    flatten("", &value, &mut rows);

    rows.retain(|(key, _)| key != "metadata.uid" && key != "metadata.etag");
    if entity.metadata.namespace.is_none() {
        rows.insert(("metadata.namespace".to_string(), DEFAULT_NAMESPACE.to_string()));
    }
    for relation in &entity.relations {
        rows.insert((
            format!("relations.{}", relation.relation_type.to_lowercase()),
            relation.target_ref.as_str().to_string(),
        ));
    }
    rows.retain(|(key, value)| key.len() <= MAX_SEARCH_KEY_LENGTH && value.len() <= MAX_SEARCH_VALUE_LENGTH);
    Ok(rows.into_iter().collect())
}

fn flatten(prefix: &str, value: &JsonValue, rows: &mut BTreeSet<(String, String)>) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                let key = key.to_lowercase();
                let path = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, rows);
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                flatten(prefix, item, rows);
            }
        }
        JsonValue::String(s) => {
            rows.insert((prefix.to_string(), s.to_lowercase()));
        }
        JsonValue::Bool(b) => {
            rows.insert((prefix.to_string(), b.to_string()));
        }
        JsonValue::Number(n) => {
            rows.insert((prefix.to_string(), n.to_string()));
        }
        JsonValue::Null => {}
    }
}

// =============================================================================
// TESTS
// =============================================================================
