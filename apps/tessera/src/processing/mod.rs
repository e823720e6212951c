//! # Default Orchestrator
//!
//! The processing pipeline used by the binary. A fixed list of
//! [`CatalogProcessor`]s runs over every claimed entity in order; each one
//! may emit relations, emit deferred entities and keep a slice of the
//! per-entity cache.
//!
//! ## Pipeline
//!
//! 1. default namespace applied
//! 2. envelope validated
//! 3. processors run in registration order
//!
//! The first processor error fails the whole pass.

mod builtin_kinds;
mod file_location;

pub use builtin_kinds::BuiltinKindsProcessor;
pub use file_location::FileLocationProcessor;
pub(crate) use file_location::parse_entities;

use serde_json::{Map, Value as JsonValue};
use std::path::PathBuf;
use tessera_core::{
    CatalogProcessingOrchestrator, Entity, EntityProcessingRequest, EntityProcessingResult,
    EntityRelationSpec, ProcessingError, apply_default_namespace, validate_envelope,
};
use thiserror::Error;

// =============================================================================
// PROCESSOR INTERFACE
// =============================================================================

/// Errors raised by a single processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The entity itself is wrong (bad spec field, unparsable file).
    #[error("{0}")]
    Input(String),

    /// Something the entity points at does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Reading an external resource failed.
    #[error("{0}")]
    Io(String),
}

impl ProcessorError {
    /// Stable error name carried into `ProcessingError::name`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Input(_) => "InputError",
            Self::NotFound(_) => "NotFoundError",
            Self::Io(_) => "IoError",
        }
    }
}

/// One step of the processing pipeline.
pub trait CatalogProcessor: Send + Sync {
    /// Unique name; also the key of this processor's cache slice.
    fn name(&self) -> &str;

    fn process(&self, entity: &Entity, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError>;
}

/// Everything a processor may emit during one pass.
#[derive(Debug)]
pub struct ProcessorContext<'a> {
    previous: &'a Map<String, JsonValue>,
    next: Map<String, JsonValue>,
    current: String,
    relations: Vec<EntityRelationSpec>,
    deferred: Vec<Entity>,
}

impl<'a> ProcessorContext<'a> {
    #[must_use]
    pub fn new(previous: &'a Map<String, JsonValue>) -> Self {
        Self {
            previous,
            next: Map::new(),
            current: String::new(),
            relations: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Switch the cache slice to the named processor.
    pub fn enter(&mut self, processor: &str) {
        self.current = processor.to_string();
    }

    /// The value the current processor cached on the previous pass.
    #[must_use]
    pub fn cached(&self) -> Option<&JsonValue> {
        self.previous.get(&self.current)
    }

    /// Cache a value for the current processor. Only values set during this
    /// pass are carried into the next one.
    pub fn set_cache(&mut self, value: JsonValue) {
        self.next.insert(self.current.clone(), value);
    }

    pub fn emit_relation(&mut self, relation: EntityRelationSpec) {
        self.relations.push(relation);
    }

    pub fn emit_entity(&mut self, entity: Entity) {
        self.deferred.push(entity);
    }

    #[must_use]
    pub fn relations(&self) -> &[EntityRelationSpec] {
        &self.relations
    }

    #[must_use]
    pub fn deferred(&self) -> &[Entity] {
        &self.deferred
    }

    fn finish(self) -> (Vec<EntityRelationSpec>, Vec<Entity>, Map<String, JsonValue>) {
        (self.relations, self.deferred, self.next)
    }
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

/// Runs a fixed processor list over each entity.
pub struct DefaultOrchestrator {
    processors: Vec<Box<dyn CatalogProcessor>>,
}

impl std::fmt::Debug for DefaultOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.processors.iter().map(|p| p.name()).collect();
        f.debug_struct("DefaultOrchestrator")
            .field("processors", &names)
            .finish()
    }
}

impl DefaultOrchestrator {
    #[must_use]
    pub fn new(processors: Vec<Box<dyn CatalogProcessor>>) -> Self {
        Self { processors }
    }

    /// The built-in pipeline: file locations, then well-known kinds.
    /// Relative file targets resolve against `base_dir`.
    #[must_use]
    pub fn builtin(base_dir: impl Into<PathBuf>) -> Self {
        Self::new(vec![
            Box::new(FileLocationProcessor::new(base_dir)),
            Box::new(BuiltinKindsProcessor),
        ])
    }

    /// Names of the registered processors, in run order.
    #[must_use]
    pub fn processor_names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name()).collect()
    }
}

impl CatalogProcessingOrchestrator for DefaultOrchestrator {
    fn process(&self, request: EntityProcessingRequest) -> EntityProcessingResult {
        let mut entity = request.entity;
        apply_default_namespace(&mut entity);
        if let Err(e) = validate_envelope(&entity) {
            return EntityProcessingResult::Failed {
                errors: vec![ProcessingError::new("InputError", e.to_string())],
            };
        }

        let previous = match request.state {
            Some(JsonValue::Object(map)) => map,
            _ => Map::new(),
        };
        let mut ctx = ProcessorContext::new(&previous);

        for processor in &self.processors {
            ctx.enter(processor.name());
            if let Err(e) = processor.process(&entity, &mut ctx) {
                return EntityProcessingResult::Failed {
                    errors: vec![ProcessingError::new(
                        e.name(),
                        format!(
                            "Processor {} threw an error while processing entity {}; caused by {}",
                            processor.name(),
                            entity.entity_ref(),
                            e
                        ),
                    )],
                };
            }
        }

        let (relations, deferred_entities, cache) = ctx.finish();
        EntityProcessingResult::Completed {
            completed_entity: entity,
            state: (!cache.is_empty()).then_some(JsonValue::Object(cache)),
            relations,
            deferred_entities,
            errors: Vec::new(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
