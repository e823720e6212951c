//! # Orchestrator Interface
//!
//! The seam between the processing engine and whatever pipeline turns an
//! unprocessed entity into a processed one. The engine only sees this trait;
//! the pipeline decides which processors run and in what order.

use crate::{Entity, EntityName, ProcessingError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A typed relation emitted while processing an entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRelationSpec {
    pub source: EntityName,
    #[serde(rename = "type")]
    pub relation_type: String,
    pub target: EntityName,
}

impl EntityRelationSpec {
    #[must_use]
    pub fn new(source: EntityName, relation_type: impl Into<String>, target: EntityName) -> Self {
        Self {
            source,
            relation_type: relation_type.into(),
            target,
        }
    }
}

/// Input of one processing pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityProcessingRequest {
    pub entity: Entity,
    /// Processor state carried over from the previous pass.
    pub state: Option<JsonValue>,
}

/// Output of one processing pass.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityProcessingResult {
    Completed {
        completed_entity: Entity,
        state: Option<JsonValue>,
        relations: Vec<EntityRelationSpec>,
        deferred_entities: Vec<Entity>,
        /// Non-fatal diagnostics.
        errors: Vec<ProcessingError>,
    },
    /// Processing failed; the previous processed entity stays in place.
    Failed { errors: Vec<ProcessingError> },
}

impl EntityProcessingResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    #[must_use]
    pub fn errors(&self) -> &[ProcessingError] {
        match self {
            Self::Completed { errors, .. } | Self::Failed { errors } => errors,
        }
    }
}

/// Runs the processing pipeline for one entity.
///
/// Implementations must not panic on bad input; every problem is reported
/// through `EntityProcessingResult::Failed`.
pub trait CatalogProcessingOrchestrator: Send + Sync {
    fn process(&self, request: EntityProcessingRequest) -> EntityProcessingResult;
}
