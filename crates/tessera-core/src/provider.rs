//! # Entity Provider Protocol
//!
//! Providers feed unprocessed entities into the catalog. Each provider is
//! handed an [`EntityProviderConnection`] once at startup and pushes
//! mutations through it whenever its view of the world changes.
//!
//! A mutation is validated as a whole before anything is written: one bad
//! envelope rejects the entire mutation.

use crate::entity::validate_envelope;
use crate::stitcher::{StitchReport, Stitcher};
use crate::store::{ProcessingStore, ReplaceReport, ReplaceUnprocessedEntities, StoreTxn};
use crate::{CatalogError, Entity};
use std::sync::Arc;

/// A change to a provider's claimed entity set.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityProviderMutation {
    /// The complete set of entities the provider claims.
    Full { entities: Vec<Entity> },
    /// Incremental additions and removals.
    Delta {
        added: Vec<Entity>,
        removed: Vec<Entity>,
    },
}

/// Outcome of one applied mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationReport {
    pub replace: ReplaceReport,
    /// Stitching of surviving entities whose relations pointed at pruned ones.
    pub restitch: StitchReport,
}

/// A source of unprocessed entities.
pub trait EntityProvider: Send + Sync {
    /// Stable name, used as the source key of the provider's root edges.
    fn provider_name(&self) -> &str;

    /// Called once at startup. The provider keeps the connection and may
    /// apply mutations immediately or later.
    fn connect(&self, connection: EntityProviderConnection) -> Result<(), CatalogError>;
}

/// A provider's handle on the processing store.
#[derive(Debug, Clone)]
pub struct EntityProviderConnection {
    store: Arc<ProcessingStore>,
    stitcher: Stitcher,
    source_key: String,
}

impl EntityProviderConnection {
    #[must_use]
    pub fn new(store: Arc<ProcessingStore>, stitcher: Stitcher, source_key: impl Into<String>) -> Self {
        Self {
            store,
            stitcher,
            source_key: source_key.into(),
        }
    }

    #[must_use]
    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    /// Validate and apply a mutation in one transaction, then re-stitch the
    /// entities whose view was touched by pruning.
    pub fn apply_mutation(&self, mutation: EntityProviderMutation) -> Result<MutationReport, CatalogError> {
        let ((), report) = self.apply_mutation_with(|_| Ok(((), mutation)))?;
        Ok(report)
    }

    /// Run `f` and apply the mutation it returns in the same transaction.
    ///
    /// Writes made by `f` commit only if the mutation is valid and applies
    /// cleanly. Pruned neighbours are re-stitched after the commit.
    pub fn apply_mutation_with<T>(
        &self,
        f: impl FnOnce(&mut StoreTxn<'_>) -> Result<(T, EntityProviderMutation), CatalogError>,
    ) -> Result<(T, MutationReport), CatalogError> {
        let (value, replace) = self.store.transaction(|tx| {
            let (value, mutation) = f(tx)?;
            let replace = self.to_replace(mutation)?;
            Ok((value, tx.replace_unprocessed_entities(replace)?))
        })?;
        let restitch = self.stitcher.stitch(&replace.pruned.restitch)?;
        Ok((value, MutationReport { replace, restitch }))
    }

    fn to_replace(&self, mutation: EntityProviderMutation) -> Result<ReplaceUnprocessedEntities, CatalogError> {
        match mutation {
            EntityProviderMutation::Full { entities } => {
                validate_all(&entities)?;
                Ok(ReplaceUnprocessedEntities::Full {
                    source_key: self.source_key.clone(),
                    items: entities,
                })
            }
            EntityProviderMutation::Delta { added, removed } => {
                validate_all(&added)?;
                validate_all(&removed)?;
                Ok(ReplaceUnprocessedEntities::Delta {
                    source_key: self.source_key.clone(),
                    added,
                    removed: removed.iter().map(Entity::entity_ref).collect(),
                })
            }
        }
    }
}

fn validate_all(entities: &[Entity]) -> Result<(), CatalogError> {
    entities.iter().try_for_each(validate_envelope)
}

// =============================================================================
// TESTS
// =============================================================================
