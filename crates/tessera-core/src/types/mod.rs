//! # Core Type Definitions
//!
//! This module contains the identity and error types shared by every part of
//! the Tessera processing store:
//! - Entity identity (`EntityRef`, `EntityName`)
//! - Reference graph edges (`ReferenceSource`, `RefreshStateReference`)
//! - Processing diagnostics (`ProcessingError`)
//! - Error types (`CatalogError`)
//!
//! ## Ordering Guarantees
//!
//! Every identity type implements `Ord` so that graph walks over
//! `BTreeSet`/`BTreeMap` visit nodes in a stable order.

use crate::primitives::DEFAULT_NAMESPACE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// ENTITY IDENTITY
// =============================================================================

/// Canonical `kind:namespace/name` identity of a catalog entity.
///
/// The string is lower-cased on construction, so two refs are equal iff they
/// name the same entity regardless of the casing used by the submitter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityRef(String);

impl EntityRef {
    /// Build a ref from its three parts.
    #[must_use]
    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self(format!("{kind}:{namespace}/{name}").to_lowercase())
    }

    /// Wrap a string that is already in canonical form, e.g. one read back
    /// from a table key.
    pub(crate) fn from_canonical(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the canonical string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the ref back into its compound name.
    #[must_use]
    pub fn to_name(&self) -> EntityName {
        // Construction guarantees both separators are present.
        let (kind, rest) = self.0.split_once(':').unwrap_or(("", &self.0));
        let (namespace, name) = rest.split_once('/').unwrap_or((DEFAULT_NAMESPACE, rest));
        EntityName {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityRef {
    type Err = CatalogError;

    /// Parse `kind:namespace/name` or the short form `kind:name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CatalogError::InvalidEntityRef(s.to_string());
        let (kind, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (namespace, name) = match rest.split_once('/') {
            Some((namespace, name)) => (namespace, name),
            None => (DEFAULT_NAMESPACE, rest),
        };
        if kind.is_empty() || namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        Ok(Self::new(kind, namespace, name))
    }
}

/// The compound `{kind, namespace, name}` form of an entity ref, as carried
/// inside relation payloads.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityName {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl EntityName {
    /// Create a compound name; an empty namespace falls back to the default.
    #[must_use]
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            kind: kind.into(),
            namespace: if namespace.is_empty() {
                DEFAULT_NAMESPACE.to_string()
            } else {
                namespace
            },
            name: name.into(),
        }
    }

    /// The canonical ref for this name.
    #[must_use]
    pub fn to_ref(&self) -> EntityRef {
        EntityRef::new(&self.kind, &self.namespace, &self.name)
    }
}

// =============================================================================
// REFERENCE GRAPH EDGES
// =============================================================================

/// Origin of a reference-graph edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReferenceSource {
    /// A root edge claimed by an external provider, identified by its key.
    Provider(String),
    /// An edge discovered while processing another entity.
    Entity(EntityRef),
}

/// A directed edge of the reference graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RefreshStateReference {
    pub source: ReferenceSource,
    pub target: EntityRef,
}

// =============================================================================
// PROCESSING DIAGNOSTICS
// =============================================================================

/// One serialized processing diagnostic, as stored in a refresh state's
/// error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingError {
    /// Short machine-friendly class of the failure, e.g. `InputError`.
    pub name: String,
    /// Human readable description.
    pub message: String,
}

impl ProcessingError {
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the Tessera catalog engine.
///
/// - No silent failures
/// - Use `Result<T, CatalogError>` for fallible operations
/// - Nothing in the store panics; all errors are recoverable
#[derive(Debug, Error)]
pub enum CatalogError {
    /// An entity envelope is malformed. Aborts the whole mutation.
    #[error("Malformed entity envelope, {0}")]
    InvalidEntity(String),

    /// A string could not be parsed as an entity ref.
    #[error("Invalid entity ref: {0}")]
    InvalidEntityRef(String),

    /// A row that must exist was not found.
    #[error("{0}")]
    NotFound(String),

    /// A uniqueness constraint was violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The underlying database failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background task failed to complete.
    #[error("Task error: {0}")]
    Task(String),
}

impl From<redb::Error> for CatalogError {
    fn from(e: redb::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::DatabaseError> for CatalogError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for CatalogError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::TableError> for CatalogError {
    fn from(e: redb::TableError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for CatalogError {
    fn from(e: redb::StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for CatalogError {
    fn from(e: redb::CommitError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<postcard::Error> for CatalogError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ref_is_case_normalized() {
        let a = EntityRef::new("Component", "Default", "Svc");
        let b = EntityRef::new("component", "default", "svc");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "component:default/svc");
    }

    #[test]
    fn entity_ref_parses_short_form_with_default_namespace() {
        let parsed: EntityRef = "Location:root".parse().expect("parse");
        assert_eq!(parsed.as_str(), "location:default/root");
    }

    #[test]
    fn entity_ref_parses_full_form() {
        let parsed: EntityRef = "group:platform/team-a".parse().expect("parse");
        assert_eq!(parsed, EntityRef::new("group", "platform", "team-a"));
    }

    #[test]
    fn entity_ref_rejects_malformed_strings() {
        for bad in ["", "component", ":default/x", "component:/x", "component:ns/", "a:b/c/d"] {
            assert!(bad.parse::<EntityRef>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn entity_ref_round_trips_through_name() {
        let r = EntityRef::new("user", "people", "jdoe");
        let name = r.to_name();
        assert_eq!(name.kind, "user");
        assert_eq!(name.namespace, "people");
        assert_eq!(name.name, "jdoe");
        assert_eq!(name.to_ref(), r);
    }

    #[test]
    fn entity_name_defaults_empty_namespace() {
        let name = EntityName::new("Group", "", "ops");
        assert_eq!(name.namespace, DEFAULT_NAMESPACE);
        assert_eq!(name.to_ref().as_str(), "group:default/ops");
    }

    #[test]
    fn not_found_message_is_verbatim() {
        let err = CatalogError::NotFound("Processing state not found for abc".to_string());
        assert_eq!(err.to_string(), "Processing state not found for abc");
    }
}
