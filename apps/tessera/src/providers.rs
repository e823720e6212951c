//! # Built-in Entity Providers
//!
//! Both providers emit `Location` entities. What a location expands to is
//! up to the processors (see [`crate::processing::FileLocationProcessor`]).
//!
//! - [`ConfigLocationProvider`] claims the locations listed in the config
//!   file, replacing its whole set on every connect.
//! - [`LocationStoreProvider`] claims the locations registered at runtime
//!   in the store's `locations` table.

use serde_json::json;
use std::sync::{Arc, OnceLock};
use tessera_core::primitives::{DEFAULT_NAMESPACE, LOCATION_API_VERSION, MANAGED_BY_LOCATION_ANNOTATION};
use tessera_core::{
    CatalogError, Entity, EntityProvider, EntityProviderConnection, EntityProviderMutation, LocationRow,
    MutationReport, ProcessingStore,
};

use crate::config::LocationConfig;

/// Length of the digest prefix used in generated location names.
const LOCATION_NAME_DIGEST_LEN: usize = 40;

/// The `Location` entity for a `(type, target)` pair.
///
/// The name is derived from the pair, so the same location always maps to
/// the same entity ref no matter which provider emits it.
#[must_use]
pub fn location_entity(location_type: &str, target: &str) -> Entity {
    let digest = blake3::hash(format!("{location_type}:{target}").as_bytes()).to_hex();
    let suffix: String = digest.chars().take(LOCATION_NAME_DIGEST_LEN).collect();

    let mut entity = Entity::new(LOCATION_API_VERSION, "Location", format!("generated-{suffix}"))
        .with_namespace(DEFAULT_NAMESPACE)
        .with_spec(json!({ "type": location_type, "target": target }));
    entity.metadata.annotations.insert(
        MANAGED_BY_LOCATION_ANNOTATION.to_string(),
        format!("{location_type}:{target}"),
    );
    entity
}

// =============================================================================
// CONFIG LOCATIONS
// =============================================================================

/// Claims the locations listed under `[[catalog.locations]]`.
#[derive(Debug, Clone)]
pub struct ConfigLocationProvider {
    locations: Vec<LocationConfig>,
}

impl ConfigLocationProvider {
    #[must_use]
    pub fn new(locations: Vec<LocationConfig>) -> Self {
        Self { locations }
    }
}

impl EntityProvider for ConfigLocationProvider {
    fn provider_name(&self) -> &str {
        "config"
    }

    fn connect(&self, connection: EntityProviderConnection) -> Result<(), CatalogError> {
        let entities = self
            .locations
            .iter()
            .map(|l| location_entity(&l.location_type, &l.target))
            .collect();
        let report = connection.apply_mutation(EntityProviderMutation::Full { entities })?;
        tracing::info!(
            locations = self.locations.len(),
            created = report.replace.created.len(),
            pruned = report.replace.pruned.deleted.len(),
            "config locations applied"
        );
        Ok(())
    }
}

// =============================================================================
// STORED LOCATIONS
// =============================================================================

/// Claims the locations registered in the store.
#[derive(Debug)]
pub struct LocationStoreProvider {
    store: Arc<ProcessingStore>,
    connection: OnceLock<EntityProviderConnection>,
}

impl LocationStoreProvider {
    #[must_use]
    pub fn new(store: Arc<ProcessingStore>) -> Self {
        Self {
            store,
            connection: OnceLock::new(),
        }
    }

    fn connection(&self) -> Result<&EntityProviderConnection, CatalogError> {
        self.connection
            .get()
            .ok_or_else(|| CatalogError::Config("location provider is not connected".to_string()))
    }

    /// Persist a new location and claim its entity in one transaction.
    pub fn add_location(&self, location_type: &str, target: &str) -> Result<(LocationRow, MutationReport), CatalogError> {
        let connection = self.connection()?;
        let (row, report) = connection.apply_mutation_with(|tx| {
            let row = tx.add_location(location_type, target)?;
            let mutation = EntityProviderMutation::Delta {
                added: vec![location_entity(&row.location_type, &row.target)],
                removed: Vec::new(),
            };
            Ok((row, mutation))
        })?;
        tracing::info!(id = %row.id, location_type, target, "location added");
        Ok((row, report))
    }

    /// Delete a location and drop the claim on its entity in one transaction.
    pub fn remove_location(&self, id: &str) -> Result<(LocationRow, MutationReport), CatalogError> {
        let connection = self.connection()?;
        let (row, report) = connection.apply_mutation_with(|tx| {
            let row = tx.remove_location(id)?;
            let mutation = EntityProviderMutation::Delta {
                added: Vec::new(),
                removed: vec![location_entity(&row.location_type, &row.target)],
            };
            Ok((row, mutation))
        })?;
        tracing::info!(
            id = %row.id,
            pruned = report.replace.pruned.deleted.len(),
            "location removed"
        );
        Ok((row, report))
    }
}

impl EntityProvider for LocationStoreProvider {
    fn provider_name(&self) -> &str {
        "locations"
    }

    fn connect(&self, connection: EntityProviderConnection) -> Result<(), CatalogError> {
        let entities: Vec<Entity> = self
            .store
            .locations()?
            .iter()
            .map(|l| location_entity(&l.location_type, &l.target))
            .collect();
        let count = entities.len();
        let connection = self.connection.get_or_init(|| connection);
        connection.apply_mutation(EntityProviderMutation::Full { entities })?;
        tracing::info!(locations = count, "stored locations applied");
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
