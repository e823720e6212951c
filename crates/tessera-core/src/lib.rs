//! # tessera-core
//!
//! The processing store of the Tessera entity catalog - THE STORE.
//!
//! This crate owns every piece of durable catalog state and the algorithms
//! that keep it consistent:
//! - the Processing Store (refresh state, reference graph, relations,
//!   final entities) on redb
//! - reachability GC of the reference graph
//! - the Stitcher that materializes final entities
//! - the provider and orchestrator interfaces the engine plugs into
//!
//! ## Architectural Constraints
//!
//! - Synchronous: no async, no network dependencies (pure Rust)
//! - Transactional: each operation is one redb write transaction
//! - Deterministic walks: `BTreeMap`/`BTreeSet` and ordered table scans
//! - Quiet: nothing is logged here; operations return reports instead

// =============================================================================
// MODULES
// =============================================================================

pub mod entity;
pub mod gc;
pub mod orchestrator;
pub mod primitives;
pub mod provider;
pub mod stitcher;
pub mod store;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    CatalogError, EntityName, EntityRef, ProcessingError, ReferenceSource, RefreshStateReference,
};

// =============================================================================
// RE-EXPORTS: Entity Model
// =============================================================================

pub use entity::{
    Entity, EntityMeta, EntityRelation, EntityStatus, EntityStatusItem, IncomingRelation,
    apply_default_namespace, validate_envelope,
};

// =============================================================================
// RE-EXPORTS: Processing
// =============================================================================

pub use gc::PruneReport;
pub use orchestrator::{
    CatalogProcessingOrchestrator, EntityProcessingRequest, EntityProcessingResult,
    EntityRelationSpec,
};
pub use provider::{EntityProvider, EntityProviderConnection, EntityProviderMutation, MutationReport};
pub use stitcher::{StitchOutcome, StitchReport, Stitcher};
pub use store::{
    FinalEntityRow, LocationRow, ProcessableEntity, ProcessedEntityUpdate, ProcessingStore,
    RefreshStateRow, RelationRow, ReplaceReport, ReplaceUnprocessedEntities, StoreConfig,
    StoreStats, StoreTxn,
};
