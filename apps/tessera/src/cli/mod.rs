//! # Tessera CLI Module
//!
//! This module implements the CLI interface for Tessera.
//!
//! ## Available Commands
//!
//! - `init` - Create the database and a config file
//! - `run` - Run providers and the processing engine until Ctrl+C
//! - `process` - Run a fixed number of processing rounds
//! - `apply` - Submit entities from a file as a provider mutation
//! - `stitch` - Re-stitch final entities
//! - `get` - Show a final entity
//! - `search` - Look up final entities by search key
//! - `status` - Show store statistics
//! - `refs` - List reference graph edges
//! - `location` - Manage registered locations

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tessera_core::CatalogError;

pub use commands::*;

use crate::config::{DEFAULT_CONFIG_FILE, TesseraConfig};

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Tessera - entity catalog processing engine
///
/// Ingests entities from providers, processes them into relations and
/// deferred entities, and stitches the final catalog view.
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the TOML config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Path to the catalog database (overrides `[database] path`)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new empty database and write a default config file
    Init {
        /// Replace an existing database
        #[arg(short, long)]
        force: bool,
    },

    /// Run providers and the processing engine until interrupted
    Run,

    /// Run processing rounds, stopping early when nothing is due
    Process {
        /// Maximum number of rounds
        #[arg(short, long, default_value = "1")]
        rounds: usize,
    },

    /// Submit entities from a JSON or YAML file on behalf of a provider
    Apply {
        /// Source key the entities are claimed under
        #[arg(short, long)]
        source: String,

        /// Path to the entity file
        #[arg(short, long)]
        file: PathBuf,

        /// Remove the file's entities from the source instead of replacing
        /// the source's full set
        #[arg(long)]
        delta_remove: bool,
    },

    /// Re-stitch final entities
    Stitch {
        /// Entity refs (`kind:namespace/name`)
        refs: Vec<String>,

        /// Stitch every known entity
        #[arg(short, long, conflicts_with = "refs")]
        all: bool,
    },

    /// Show the final entity for a ref
    Get {
        /// Entity ref (`kind:namespace/name`)
        entity_ref: String,
    },

    /// Find final entities by search key and value
    Search {
        /// Dotted key, e.g. `spec.type` or `relations.ownedby`
        #[arg(short, long)]
        key: String,

        /// Value to match (case-insensitive)
        #[arg(short, long)]
        value: String,
    },

    /// Show store statistics
    Status,

    /// List reference graph edges
    Refs,

    /// Manage registered locations
    Location {
        #[command(subcommand)]
        action: LocationCommand,
    },
}

/// `tessera location` subcommands.
#[derive(Subcommand, Debug)]
pub enum LocationCommand {
    /// Register a location
    Add {
        /// Location type, e.g. `file`
        #[arg(short = 't', long = "type", default_value = "file")]
        location_type: String,

        /// Location target, e.g. a path relative to the config file
        target: String,
    },

    /// List registered locations
    List,

    /// Remove a location by id
    Remove {
        /// Location id
        id: String,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), CatalogError> {
    if let Some(Commands::Init { force }) = cli.command {
        return cmd_init(&cli.config, cli.database.as_deref(), force);
    }

    let config = TesseraConfig::load(&cli.config)?;
    let ctx = CommandContext::new(&cli.config, cli.database, config, cli.json_mode);

    match cli.command {
        Some(Commands::Run) => cmd_run(&ctx).await,
        Some(Commands::Process { rounds }) => cmd_process(&ctx, rounds).await,
        Some(Commands::Apply {
            source,
            file,
            delta_remove,
        }) => cmd_apply(&ctx, &source, &file, delta_remove),
        Some(Commands::Stitch { refs, all }) => cmd_stitch(&ctx, &refs, all),
        Some(Commands::Get { entity_ref }) => cmd_get(&ctx, &entity_ref),
        Some(Commands::Search { key, value }) => cmd_search(&ctx, &key, &value),
        Some(Commands::Refs) => cmd_refs(&ctx),
        Some(Commands::Location { action }) => cmd_location(&ctx, action),
        Some(Commands::Status) | Some(Commands::Init { .. }) | None => {
            // No subcommand - show status by default
            cmd_status(&ctx)
        }
    }
}
