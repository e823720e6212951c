//! # Table Layout
//!
//! redb table definitions and the low-level row helpers shared by the
//! processing transaction, the GC and the stitcher.
//!
//! Readers are generic over `ReadableTable` so the same helper serves a
//! read-only snapshot and an open write transaction. Writers take the
//! `WriteTransaction` and open only the tables they touch, closing them
//! before returning, so helpers can be chained freely.

use super::{FinalEntityRow, LocationRow, RefreshStateRow, RelationRow};
use crate::{CatalogError, EntityRef, ReferenceSource, RefreshStateReference};
use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Refresh state rows: entity_ref -> postcard `RefreshStateRow`.
pub(crate) const REFRESH_STATE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("refresh_state");

/// Unique id index: entity_id -> entity_ref.
pub(crate) const REFRESH_STATE_IDS: TableDefinition<&str, &str> =
    TableDefinition::new("refresh_state_ids");

/// Due queue: (next_update_at millis, entity_ref) -> ().
pub(crate) const REFRESH_STATE_DUE: TableDefinition<(i64, &str), ()> =
    TableDefinition::new("refresh_state_due");

/// Reference edges keyed by source: (source tag, source, target) -> ().
pub(crate) const REFS_BY_SOURCE: TableDefinition<(u8, &str, &str), ()> =
    TableDefinition::new("refs_by_source");

/// Reference edges keyed by target: (target, source tag, source) -> ().
pub(crate) const REFS_BY_TARGET: TableDefinition<(&str, u8, &str), ()> =
    TableDefinition::new("refs_by_target");

/// Relations keyed by originating entity: (origin, source, type, target) -> ().
pub(crate) const RELATIONS_BY_ORIGIN: TableDefinition<(&str, &str, &str, &str), ()> =
    TableDefinition::new("relations_by_origin");

/// Relations keyed by source: (source, type, target, origin) -> ().
pub(crate) const RELATIONS_BY_SOURCE: TableDefinition<(&str, &str, &str, &str), ()> =
    TableDefinition::new("relations_by_source");

/// Relations keyed by target: (target, type, source, origin) -> ().
pub(crate) const RELATIONS_BY_TARGET: TableDefinition<(&str, &str, &str, &str), ()> =
    TableDefinition::new("relations_by_target");

/// Final entities: entity_id -> postcard `FinalEntityRow`.
pub(crate) const FINAL_ENTITIES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("final_entities");

/// Search index: (key, value, entity_id) -> ().
pub(crate) const SEARCH: TableDefinition<(&str, &str, &str), ()> = TableDefinition::new("search");

/// Search index by entity: (entity_id, key, value) -> ().
pub(crate) const SEARCH_BY_ENTITY: TableDefinition<(&str, &str, &str), ()> =
    TableDefinition::new("search_by_entity");

/// Registered locations: id -> postcard `LocationRow`.
pub(crate) const LOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("locations");

/// Counters: key -> u64.
pub(crate) const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

/// Counter key for the stitch ticket sequence.
pub(crate) const STITCH_TICKET_KEY: &str = "stitch_ticket";

const PROVIDER_SOURCE: u8 = 0;
const ENTITY_SOURCE: u8 = 1;

type Str = &'static str;
type Bytes = &'static [u8];
type SourceKey = (u8, Str, Str);
type TargetKey = (Str, u8, Str);
type RelationKey = (Str, Str, Str, Str);
type SearchKey = (Str, Str, Str);

// =============================================================================
// ENCODING
// =============================================================================

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CatalogError> {
    Ok(postcard::to_allocvec(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CatalogError> {
    Ok(postcard::from_bytes(bytes)?)
}

fn source_parts(source: &ReferenceSource) -> (u8, &str) {
    match source {
        ReferenceSource::Provider(key) => (PROVIDER_SOURCE, key.as_str()),
        ReferenceSource::Entity(entity_ref) => (ENTITY_SOURCE, entity_ref.as_str()),
    }
}

fn source_from_parts(tag: u8, source: &str) -> ReferenceSource {
    if tag == PROVIDER_SOURCE {
        ReferenceSource::Provider(source.to_string())
    } else {
        ReferenceSource::Entity(EntityRef::from_canonical(source))
    }
}

/// Create every table so read transactions never hit a missing one.
pub(crate) fn create_all(txn: &WriteTransaction) -> Result<(), CatalogError> {
    let _ = txn.open_table(REFRESH_STATE)?;
    let _ = txn.open_table(REFRESH_STATE_IDS)?;
    let _ = txn.open_table(REFRESH_STATE_DUE)?;
    let _ = txn.open_table(REFS_BY_SOURCE)?;
    let _ = txn.open_table(REFS_BY_TARGET)?;
    let _ = txn.open_table(RELATIONS_BY_ORIGIN)?;
    let _ = txn.open_table(RELATIONS_BY_SOURCE)?;
    let _ = txn.open_table(RELATIONS_BY_TARGET)?;
    let _ = txn.open_table(FINAL_ENTITIES)?;
    let _ = txn.open_table(SEARCH)?;
    let _ = txn.open_table(SEARCH_BY_ENTITY)?;
    let _ = txn.open_table(LOCATIONS)?;
    let _ = txn.open_table(METADATA)?;
    Ok(())
}

// =============================================================================
// REFRESH STATE
// =============================================================================

pub(crate) fn get_state<T>(table: &T, entity_ref: &str) -> Result<Option<RefreshStateRow>, CatalogError>
where
    T: ReadableTable<Str, Bytes>,
{
    match table.get(entity_ref)? {
        Some(data) => Ok(Some(decode(data.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn all_states<T>(table: &T) -> Result<Vec<RefreshStateRow>, CatalogError>
where
    T: ReadableTable<Str, Bytes>,
{
    let mut rows = Vec::new();
    for entry in table.iter()? {
        let (_, data) = entry?;
        rows.push(decode(data.value())?);
    }
    Ok(rows)
}

pub(crate) fn read_state(
    txn: &WriteTransaction,
    entity_ref: &str,
) -> Result<Option<RefreshStateRow>, CatalogError> {
    let table = txn.open_table(REFRESH_STATE)?;
    get_state(&table, entity_ref)
}

pub(crate) fn read_state_ref_by_id(
    txn: &WriteTransaction,
    entity_id: &str,
) -> Result<Option<String>, CatalogError> {
    let table = txn.open_table(REFRESH_STATE_IDS)?;
    let entity_ref = table.get(entity_id)?.map(|v| v.value().to_string());
    Ok(entity_ref)
}

/// Write a refresh state row, keeping the id and due indexes in step with
/// the row it replaces.
pub(crate) fn put_state(
    txn: &WriteTransaction,
    row: &RefreshStateRow,
    previous: Option<&RefreshStateRow>,
) -> Result<(), CatalogError> {
    let entity_ref = row.entity_ref.as_str();
    let bytes = encode(row)?;
    {
        let mut table = txn.open_table(REFRESH_STATE)?;
        table.insert(entity_ref, bytes.as_slice())?;
    }
    {
        let mut ids = txn.open_table(REFRESH_STATE_IDS)?;
        if let Some(previous) = previous
            && previous.entity_id != row.entity_id
        {
            ids.remove(previous.entity_id.as_str())?;
        }
        ids.insert(row.entity_id.as_str(), entity_ref)?;
    }
    {
        let mut due = txn.open_table(REFRESH_STATE_DUE)?;
        if let Some(previous) = previous {
            due.remove((previous.next_update_at.timestamp_millis(), entity_ref))?;
        }
        due.insert((row.next_update_at.timestamp_millis(), entity_ref), ())?;
    }
    Ok(())
}

/// Delete a refresh state row and its index entries.
pub(crate) fn delete_state(
    txn: &WriteTransaction,
    entity_ref: &str,
) -> Result<Option<RefreshStateRow>, CatalogError> {
    let Some(row) = read_state(txn, entity_ref)? else {
        return Ok(None);
    };
    {
        let mut table = txn.open_table(REFRESH_STATE)?;
        table.remove(entity_ref)?;
    }
    {
        let mut ids = txn.open_table(REFRESH_STATE_IDS)?;
        ids.remove(row.entity_id.as_str())?;
    }
    {
        let mut due = txn.open_table(REFRESH_STATE_DUE)?;
        due.remove((row.next_update_at.timestamp_millis(), entity_ref))?;
    }
    Ok(Some(row))
}

/// Refs whose `next_update_at` is at or before `now_millis`, oldest first.
pub(crate) fn due_refs(
    txn: &WriteTransaction,
    now_millis: i64,
    limit: usize,
) -> Result<Vec<String>, CatalogError> {
    let due = txn.open_table(REFRESH_STATE_DUE)?;
    let mut refs = Vec::new();
    for entry in due.range(..(now_millis.saturating_add(1), ""))? {
        if refs.len() >= limit {
            break;
        }
        let (key, _) = entry?;
        let (_, entity_ref) = key.value();
        refs.push(entity_ref.to_string());
    }
    Ok(refs)
}

// =============================================================================
// REFERENCE EDGES
// =============================================================================

/// Targets of every edge leaving `source`.
pub(crate) fn targets_of<T>(table: &T, source: &ReferenceSource) -> Result<Vec<EntityRef>, CatalogError>
where
    T: ReadableTable<SourceKey, ()>,
{
    let (tag, key) = source_parts(source);
    let mut targets = Vec::new();
    for entry in table.range((tag, key, "")..)? {
        let (k, _) = entry?;
        let (t, s, target) = k.value();
        if t != tag || s != key {
            break;
        }
        targets.push(EntityRef::from_canonical(target));
    }
    Ok(targets)
}

/// Sources of every edge arriving at `target`.
pub(crate) fn sources_of<T>(table: &T, target: &str) -> Result<Vec<ReferenceSource>, CatalogError>
where
    T: ReadableTable<TargetKey, ()>,
{
    let mut sources = Vec::new();
    for entry in table.range((target, PROVIDER_SOURCE, "")..)? {
        let (k, _) = entry?;
        let (t, tag, source) = k.value();
        if t != target {
            break;
        }
        sources.push(source_from_parts(tag, source));
    }
    Ok(sources)
}

pub(crate) fn all_edges<T>(table: &T) -> Result<Vec<RefreshStateReference>, CatalogError>
where
    T: ReadableTable<SourceKey, ()>,
{
    let mut edges = Vec::new();
    for entry in table.iter()? {
        let (k, _) = entry?;
        let (tag, source, target) = k.value();
        edges.push(RefreshStateReference {
            source: source_from_parts(tag, source),
            target: EntityRef::from_canonical(target),
        });
    }
    Ok(edges)
}

pub(crate) fn edge_targets(
    txn: &WriteTransaction,
    source: &ReferenceSource,
) -> Result<Vec<EntityRef>, CatalogError> {
    let table = txn.open_table(REFS_BY_SOURCE)?;
    targets_of(&table, source)
}

pub(crate) fn edge_sources(
    txn: &WriteTransaction,
    target: &str,
) -> Result<Vec<ReferenceSource>, CatalogError> {
    let table = txn.open_table(REFS_BY_TARGET)?;
    sources_of(&table, target)
}

pub(crate) fn insert_edge(
    txn: &WriteTransaction,
    source: &ReferenceSource,
    target: &str,
) -> Result<(), CatalogError> {
    let (tag, key) = source_parts(source);
    {
        let mut by_source = txn.open_table(REFS_BY_SOURCE)?;
        by_source.insert((tag, key, target), ())?;
    }
    {
        let mut by_target = txn.open_table(REFS_BY_TARGET)?;
        by_target.insert((target, tag, key), ())?;
    }
    Ok(())
}

/// Remove one edge. Returns whether it existed.
pub(crate) fn remove_edge(
    txn: &WriteTransaction,
    source: &ReferenceSource,
    target: &str,
) -> Result<bool, CatalogError> {
    let (tag, key) = source_parts(source);
    let existed = {
        let mut by_source = txn.open_table(REFS_BY_SOURCE)?;
        by_source.remove((tag, key, target))?.is_some()
    };
    {
        let mut by_target = txn.open_table(REFS_BY_TARGET)?;
        by_target.remove((target, tag, key))?;
    }
    Ok(existed)
}

// =============================================================================
// RELATIONS
// =============================================================================

fn collect_relations<T>(
    table: &T,
    prefix: &str,
    to_row: impl Fn((&str, &str, &str, &str)) -> RelationRow,
) -> Result<Vec<RelationRow>, CatalogError>
where
    T: ReadableTable<RelationKey, ()>,
{
    let mut rows = Vec::new();
    for entry in table.range((prefix, "", "", "")..)? {
        let (k, _) = entry?;
        let key = k.value();
        if key.0 != prefix {
            break;
        }
        rows.push(to_row(key));
    }
    Ok(rows)
}

/// Relations whose source is `source`, read from `relations_by_source`.
pub(crate) fn relations_with_source<T>(table: &T, source: &str) -> Result<Vec<RelationRow>, CatalogError>
where
    T: ReadableTable<RelationKey, ()>,
{
    collect_relations(table, source, |(source, relation_type, target, origin)| {
        RelationRow::from_parts(origin, source, relation_type, target)
    })
}

/// Relations whose target is `target`, read from `relations_by_target`.
pub(crate) fn relations_with_target<T>(table: &T, target: &str) -> Result<Vec<RelationRow>, CatalogError>
where
    T: ReadableTable<RelationKey, ()>,
{
    collect_relations(table, target, |(target, relation_type, source, origin)| {
        RelationRow::from_parts(origin, source, relation_type, target)
    })
}

/// Relations emitted by `origin`, read from `relations_by_origin`.
pub(crate) fn relations_from_origin<T>(table: &T, origin: &str) -> Result<Vec<RelationRow>, CatalogError>
where
    T: ReadableTable<RelationKey, ()>,
{
    collect_relations(table, origin, |(origin, source, relation_type, target)| {
        RelationRow::from_parts(origin, source, relation_type, target)
    })
}

pub(crate) fn all_relations<T>(table: &T) -> Result<Vec<RelationRow>, CatalogError>
where
    T: ReadableTable<RelationKey, ()>,
{
    let mut rows = Vec::new();
    for entry in table.iter()? {
        let (k, _) = entry?;
        let (origin, source, relation_type, target) = k.value();
        rows.push(RelationRow::from_parts(origin, source, relation_type, target));
    }
    Ok(rows)
}

pub(crate) fn insert_relation(txn: &WriteTransaction, row: &RelationRow) -> Result<(), CatalogError> {
    let origin = row.originating_entity_id.as_str();
    let source = row.source.as_str();
    let relation_type = row.relation_type.as_str();
    let target = row.target.as_str();
    {
        let mut table = txn.open_table(RELATIONS_BY_ORIGIN)?;
        table.insert((origin, source, relation_type, target), ())?;
    }
    {
        let mut table = txn.open_table(RELATIONS_BY_SOURCE)?;
        table.insert((source, relation_type, target, origin), ())?;
    }
    {
        let mut table = txn.open_table(RELATIONS_BY_TARGET)?;
        table.insert((target, relation_type, source, origin), ())?;
    }
    Ok(())
}

/// Delete every relation emitted by `origin`, returning what was removed.
pub(crate) fn delete_relations_from(
    txn: &WriteTransaction,
    origin: &str,
) -> Result<Vec<RelationRow>, CatalogError> {
    let rows = {
        let table = txn.open_table(RELATIONS_BY_ORIGIN)?;
        relations_from_origin(&table, origin)?
    };
    if rows.is_empty() {
        return Ok(rows);
    }
    let mut by_origin = txn.open_table(RELATIONS_BY_ORIGIN)?;
    let mut by_source = txn.open_table(RELATIONS_BY_SOURCE)?;
    let mut by_target = txn.open_table(RELATIONS_BY_TARGET)?;
    for row in &rows {
        let source = row.source.as_str();
        let relation_type = row.relation_type.as_str();
        let target = row.target.as_str();
        by_origin.remove((origin, source, relation_type, target))?;
        by_source.remove((source, relation_type, target, origin))?;
        by_target.remove((target, relation_type, source, origin))?;
    }
    Ok(rows)
}

// =============================================================================
// FINAL ENTITIES AND SEARCH
// =============================================================================

pub(crate) fn get_final<T>(table: &T, entity_id: &str) -> Result<Option<FinalEntityRow>, CatalogError>
where
    T: ReadableTable<Str, Bytes>,
{
    match table.get(entity_id)? {
        Some(data) => Ok(Some(decode(data.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn all_finals<T>(table: &T) -> Result<Vec<FinalEntityRow>, CatalogError>
where
    T: ReadableTable<Str, Bytes>,
{
    let mut rows = Vec::new();
    for entry in table.iter()? {
        let (_, data) = entry?;
        rows.push(decode(data.value())?);
    }
    Ok(rows)
}

pub(crate) fn read_final(
    txn: &WriteTransaction,
    entity_id: &str,
) -> Result<Option<FinalEntityRow>, CatalogError> {
    let table = txn.open_table(FINAL_ENTITIES)?;
    get_final(&table, entity_id)
}

pub(crate) fn put_final(txn: &WriteTransaction, row: &FinalEntityRow) -> Result<(), CatalogError> {
    let bytes = encode(row)?;
    let mut table = txn.open_table(FINAL_ENTITIES)?;
    table.insert(row.entity_id.as_str(), bytes.as_slice())?;
    Ok(())
}

/// Delete a final entity together with its search rows.
pub(crate) fn delete_final(txn: &WriteTransaction, entity_id: &str) -> Result<bool, CatalogError> {
    let existed = {
        let mut table = txn.open_table(FINAL_ENTITIES)?;
        table.remove(entity_id)?.is_some()
    };
    replace_search(txn, entity_id, &[])?;
    Ok(existed)
}

/// Replace the search rows of one entity.
pub(crate) fn replace_search(
    txn: &WriteTransaction,
    entity_id: &str,
    rows: &[(String, String)],
) -> Result<(), CatalogError> {
    let existing = {
        let table = txn.open_table(SEARCH_BY_ENTITY)?;
        let mut existing = Vec::new();
        for entry in table.range((entity_id, "", "")..)? {
            let (k, _) = entry?;
            let (id, key, value) = k.value();
            if id != entity_id {
                break;
            }
            existing.push((key.to_string(), value.to_string()));
        }
        existing
    };
    let mut search = txn.open_table(SEARCH)?;
    let mut by_entity = txn.open_table(SEARCH_BY_ENTITY)?;
    for (key, value) in &existing {
        search.remove((key.as_str(), value.as_str(), entity_id))?;
        by_entity.remove((entity_id, key.as_str(), value.as_str()))?;
    }
    for (key, value) in rows {
        search.insert((key.as_str(), value.as_str(), entity_id), ())?;
        by_entity.insert((entity_id, key.as_str(), value.as_str()), ())?;
    }
    Ok(())
}

/// Entity ids whose search rows contain `key = value`.
pub(crate) fn search_ids<T>(table: &T, key: &str, value: &str) -> Result<Vec<String>, CatalogError>
where
    T: ReadableTable<SearchKey, ()>,
{
    let mut ids = Vec::new();
    for entry in table.range((key, value, "")..)? {
        let (k, _) = entry?;
        let (k_key, k_value, id) = k.value();
        if k_key != key || k_value != value {
            break;
        }
        ids.push(id.to_string());
    }
    Ok(ids)
}

/// Search rows of one entity.
pub(crate) fn search_rows_of<T>(table: &T, entity_id: &str) -> Result<Vec<(String, String)>, CatalogError>
where
    T: ReadableTable<SearchKey, ()>,
{
    let mut rows = Vec::new();
    for entry in table.range((entity_id, "", "")..)? {
        let (k, _) = entry?;
        let (id, key, value) = k.value();
        if id != entity_id {
            break;
        }
        rows.push((key.to_string(), value.to_string()));
    }
    Ok(rows)
}

/// Allocate the next stitch ticket.
pub(crate) fn next_ticket(txn: &WriteTransaction) -> Result<u64, CatalogError> {
    let mut table = txn.open_table(METADATA)?;
    let current = table.get(STITCH_TICKET_KEY)?.map(|v| v.value()).unwrap_or(0);
    let next = current.saturating_add(1);
    table.insert(STITCH_TICKET_KEY, next)?;
    Ok(next)
}

// =============================================================================
// LOCATIONS
// =============================================================================

pub(crate) fn all_locations<T>(table: &T) -> Result<Vec<LocationRow>, CatalogError>
where
    T: ReadableTable<Str, Bytes>,
{
    let mut rows = Vec::new();
    for entry in table.iter()? {
        let (_, data) = entry?;
        rows.push(decode(data.value())?);
    }
    Ok(rows)
}

pub(crate) fn put_location(txn: &WriteTransaction, row: &LocationRow) -> Result<(), CatalogError> {
    let bytes = encode(row)?;
    let mut table = txn.open_table(LOCATIONS)?;
    table.insert(row.id.as_str(), bytes.as_slice())?;
    Ok(())
}

pub(crate) fn delete_location(
    txn: &WriteTransaction,
    id: &str,
) -> Result<Option<LocationRow>, CatalogError> {
    let mut table = txn.open_table(LOCATIONS)?;
    let removed = match table.remove(id)? {
        Some(data) => Some(decode(data.value())?),
        None => None,
    };
    Ok(removed)
}
