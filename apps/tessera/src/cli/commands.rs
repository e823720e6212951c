//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use super::LocationCommand;
use crate::config::{CONFIG_TEMPLATE, TesseraConfig};
use crate::engine::ProcessingEngine;
use crate::processing::{DefaultOrchestrator, parse_entities};
use crate::providers::{ConfigLocationProvider, LocationStoreProvider};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tessera_core::{
    CatalogError, EntityProvider, EntityProviderConnection, EntityProviderMutation, EntityRef,
    ProcessingStore, ReferenceSource, Stitcher,
};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of an entity file accepted by `apply` (100 MB).
const MAX_APPLY_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), CatalogError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| CatalogError::Config(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(CatalogError::InvalidEntity(format!(
            "file size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Resolve `..` and symlinks, and make sure the path is a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, CatalogError> {
    let canonical = path.canonicalize().map_err(|e| {
        CatalogError::Config(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(CatalogError::Config(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// =============================================================================
// COMMAND CONTEXT
// =============================================================================

/// Resolved settings shared by every command.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub config: TesseraConfig,
    pub database: PathBuf,
    /// Directory relative file locations resolve against: the config
    /// file's directory.
    pub base_dir: PathBuf,
    pub json_mode: bool,
}

impl CommandContext {
    #[must_use]
    pub fn new(config_path: &Path, database: Option<PathBuf>, config: TesseraConfig, json_mode: bool) -> Self {
        let base_dir = config_dir(config_path);
        let database = database.unwrap_or_else(|| base_dir.join(&config.database.path));
        Self {
            config,
            database,
            base_dir,
            json_mode,
        }
    }

    fn open_store(&self) -> Result<Arc<ProcessingStore>, CatalogError> {
        Ok(Arc::new(ProcessingStore::open(
            &self.database,
            self.config.store_config(),
        )?))
    }

    /// The engine as `run` and `process` use it: the built-in pipeline fed
    /// by the config and stored-location providers.
    fn engine(&self) -> Result<ProcessingEngine, CatalogError> {
        let store = self.open_store()?;
        let providers: Vec<Arc<dyn EntityProvider>> = vec![
            Arc::new(ConfigLocationProvider::new(self.config.catalog.locations.clone())),
            Arc::new(LocationStoreProvider::new(Arc::clone(&store))),
        ];
        Ok(ProcessingEngine::new(
            Arc::clone(&store),
            Arc::new(DefaultOrchestrator::builtin(&self.base_dir)),
            Stitcher::new(store),
            providers,
            self.config.engine_config(),
        ))
    }
}

fn config_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create the database and, if absent, a default config file.
pub fn cmd_init(config_path: &Path, database: Option<&Path>, force: bool) -> Result<(), CatalogError> {
    let config = TesseraConfig::load(config_path)?;
    let db_path = database.map_or_else(
        || config_dir(config_path).join(&config.database.path),
        Path::to_path_buf,
    );

    if db_path.exists() {
        if !force {
            return Err(CatalogError::Conflict(format!(
                "Database {:?} already exists. Use --force to replace it.",
                db_path
            )));
        }
        std::fs::remove_file(&db_path).map_err(|e| {
            CatalogError::Storage(format!("Cannot remove {}: {}", db_path.display(), e))
        })?;
    }

    ProcessingStore::open(&db_path, config.store_config())?;
    println!("Initialized database: {:?}", db_path);

    if !config_path.exists() {
        std::fs::write(config_path, CONFIG_TEMPLATE).map_err(|e| {
            CatalogError::Config(format!("Cannot write {}: {}", config_path.display(), e))
        })?;
        println!("Wrote config:         {:?}", config_path);
    }

    Ok(())
}

// =============================================================================
// RUN COMMAND
// =============================================================================

/// Run the engine until Ctrl+C, then drain in-flight work.
pub async fn cmd_run(ctx: &CommandContext) -> Result<(), CatalogError> {
    let engine = ctx.engine()?;
    let engine_config = engine.config().clone();

    println!("Tessera Processing Engine Starting...");
    println!();
    println!("Configuration:");
    println!("  Database:   {:?}", ctx.database);
    println!("  Workers:    {}", engine_config.workers);
    println!("  Batch size: {}", engine_config.batch_size);
    println!("  Locations:  {}", ctx.config.catalog.locations.len());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let handle = engine.start().await?;
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CatalogError::Task(format!("Cannot listen for Ctrl+C: {}", e)))?;
    tracing::info!("shutdown requested, draining workers");
    handle.stop().await
}

// =============================================================================
// PROCESS COMMAND
// =============================================================================

/// Connect providers and run up to `rounds` processing rounds.
pub async fn cmd_process(ctx: &CommandContext, rounds: usize) -> Result<(), CatalogError> {
    let engine = ctx.engine()?;
    engine.connect_providers().await?;

    let mut processed = 0;
    let mut completed_rounds = 0;
    for _ in 0..rounds {
        let claimed = engine.process_batch().await?;
        if claimed == 0 {
            break;
        }
        processed += claimed;
        completed_rounds += 1;
    }

    if ctx.json_mode {
        print_json(&serde_json::json!({
            "rounds": completed_rounds,
            "processed": processed
        }));
        return Ok(());
    }

    println!("Processed {} entities in {} rounds", processed, completed_rounds);
    Ok(())
}

// =============================================================================
// APPLY COMMAND
// =============================================================================

/// Submit a file of entities as a `full` mutation (or a `delta` removal)
/// under `source`.
pub fn cmd_apply(ctx: &CommandContext, source: &str, file: &Path, delta_remove: bool) -> Result<(), CatalogError> {
    let path = validate_file_path(file)?;
    validate_file_size(&path, MAX_APPLY_FILE_SIZE)?;
    let bytes = std::fs::read(&path)
        .map_err(|e| CatalogError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
    let entities =
        parse_entities(&path, &bytes).map_err(|e| CatalogError::InvalidEntity(e.to_string()))?;
    let count = entities.len();

    let store = ctx.open_store()?;
    let connection = EntityProviderConnection::new(Arc::clone(&store), Stitcher::new(store), source);
    let mutation = if delta_remove {
        EntityProviderMutation::Delta {
            added: Vec::new(),
            removed: entities,
        }
    } else {
        EntityProviderMutation::Full { entities }
    };
    let report = connection.apply_mutation(mutation)?;

    if ctx.json_mode {
        print_json(&serde_json::json!({
            "source": source,
            "entities": count,
            "created": report.replace.created,
            "removed_claims": report.replace.removed_claims,
            "deleted": report.replace.pruned.deleted,
            "restitched": report.restitch
        }));
        return Ok(());
    }

    println!("Applied {} entities from {:?} as '{}'", count, path, source);
    println!("  Created:        {}", report.replace.created.len());
    println!("  Removed claims: {}", report.replace.removed_claims);
    println!("  Deleted:        {}", report.replace.pruned.deleted.len());
    println!("  Restitched:     {}", report.restitch.committed);
    Ok(())
}

// =============================================================================
// STITCH COMMAND
// =============================================================================

/// Stitch the given refs, or every known entity with `--all`.
pub fn cmd_stitch(ctx: &CommandContext, refs: &[String], all: bool) -> Result<(), CatalogError> {
    let store = ctx.open_store()?;
    let targets: BTreeSet<EntityRef> = if all {
        store
            .refresh_states()?
            .into_iter()
            .map(|row| row.entity_ref)
            .collect()
    } else {
        refs.iter()
            .map(|r| r.parse())
            .collect::<Result<_, CatalogError>>()?
    };

    let report = Stitcher::new(store).stitch(&targets)?;

    if ctx.json_mode {
        print_json(&serde_json::json!(report));
        return Ok(());
    }

    println!("Stitched {} entities", report.total());
    println!("  Committed:  {}", report.committed);
    println!("  Unchanged:  {}", report.unchanged);
    println!("  Superseded: {}", report.superseded);
    println!("  Skipped:    {}", report.skipped);
    Ok(())
}

// =============================================================================
// READ COMMANDS
// =============================================================================

/// Print the final entity for a ref as JSON.
pub fn cmd_get(ctx: &CommandContext, entity_ref: &str) -> Result<(), CatalogError> {
    let entity_ref: EntityRef = entity_ref.parse()?;
    let store = ctx.open_store()?;
    let entity = store
        .final_entity(&entity_ref)?
        .map(|row| row.entity())
        .transpose()?
        .flatten()
        .ok_or_else(|| CatalogError::NotFound(format!("No final entity for {}", entity_ref)))?;

    println!("{}", serde_json::to_string_pretty(&entity)?);
    Ok(())
}

/// List final entities matching a search key and value.
pub fn cmd_search(ctx: &CommandContext, key: &str, value: &str) -> Result<(), CatalogError> {
    let store = ctx.open_store()?;
    let refs: Vec<EntityRef> = store
        .search(key, value)?
        .into_iter()
        .map(|row| row.entity_ref)
        .collect();

    if ctx.json_mode {
        print_json(&serde_json::json!(refs));
        return Ok(());
    }

    if refs.is_empty() {
        println!("No entities match {}={}", key, value);
    }
    for entity_ref in refs {
        println!("{}", entity_ref);
    }
    Ok(())
}

/// Show store statistics.
pub fn cmd_status(ctx: &CommandContext) -> Result<(), CatalogError> {
    let store = ctx.open_store()?;
    let stats = store.stats()?;

    if ctx.json_mode {
        let mut output = serde_json::json!(stats);
        output["database"] = serde_json::json!(ctx.database.to_string_lossy());
        print_json(&output);
        return Ok(());
    }

    println!("Tessera Catalog Status");
    println!("======================");
    println!("Database: {:?}", ctx.database);
    println!();
    println!("Refresh states: {}", stats.refresh_states);
    println!("References:     {}", stats.references);
    println!("Relations:      {}", stats.relations);
    println!("Final entities: {}", stats.final_entities);
    println!("Search rows:    {}", stats.search_rows);
    println!("Locations:      {}", stats.locations);

    Ok(())
}

/// List every reference graph edge as `source -> target`.
pub fn cmd_refs(ctx: &CommandContext) -> Result<(), CatalogError> {
    let store = ctx.open_store()?;
    let edges = store.references()?;

    if ctx.json_mode {
        print_json(&serde_json::json!(edges));
        return Ok(());
    }

    for edge in edges {
        match edge.source {
            ReferenceSource::Provider(key) => println!("<{}> -> {}", key, edge.target),
            ReferenceSource::Entity(source) => println!("{} -> {}", source, edge.target),
        }
    }
    Ok(())
}

// =============================================================================
// LOCATION COMMANDS
// =============================================================================

/// Add, list or remove stored locations.
pub fn cmd_location(ctx: &CommandContext, action: LocationCommand) -> Result<(), CatalogError> {
    let store = ctx.open_store()?;

    if let LocationCommand::List = action {
        let locations = store.locations()?;
        if ctx.json_mode {
            print_json(&serde_json::json!(locations));
            return Ok(());
        }
        for location in locations {
            println!("{}  {}:{}", location.id, location.location_type, location.target);
        }
        return Ok(());
    }

    let provider = LocationStoreProvider::new(Arc::clone(&store));
    provider.connect(EntityProviderConnection::new(
        Arc::clone(&store),
        Stitcher::new(Arc::clone(&store)),
        provider.provider_name(),
    ))?;

    let (row, verb) = match action {
        LocationCommand::Add {
            location_type,
            target,
        } => (provider.add_location(&location_type, &target)?.0, "Added"),
        LocationCommand::Remove { id } => (provider.remove_location(&id)?.0, "Removed"),
        LocationCommand::List => return Ok(()),
    };

    if ctx.json_mode {
        print_json(&serde_json::json!(row));
        return Ok(());
    }

    println!("{} location {}  {}:{}", verb, row.id, row.location_type, row.target);
    Ok(())
}
