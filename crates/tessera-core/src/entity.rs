//! # Entity Envelope
//!
//! The typed shape of a catalog entity and the envelope rules every entity
//! must satisfy before it may enter the processing store.
//!
//! Unknown fields are preserved: the entity and its `metadata` keep extra
//! keys in flattened maps and `spec` is free-form JSON, so a submitted
//! entity survives a store round trip unchanged.

use crate::primitives::{DEFAULT_NAMESPACE, MAX_API_VERSION_LENGTH, MAX_NAME_LENGTH};
use crate::{CatalogError, EntityName, EntityRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

// =============================================================================
// ENTITY
// =============================================================================

/// A catalog entity.
///
/// `relations`, `incoming_relations` and `status` are only populated on
/// stitched (final) entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub api_version: String,
    pub kind: String,
    pub metadata: EntityMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<EntityRelation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incoming_relations: Vec<IncomingRelation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EntityStatus>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Entity metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// An outgoing relation on a stitched entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRelation {
    #[serde(rename = "type")]
    pub relation_type: String,
    pub target_ref: EntityRef,
    pub target: EntityName,
}

/// A relation on a stitched entity that some other entity points at it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingRelation {
    #[serde(rename = "type")]
    pub relation_type: String,
    pub source_ref: EntityRef,
    pub source: EntityName,
}

/// Status block attached to stitched entities.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityStatus {
    #[serde(default)]
    pub items: Vec<EntityStatusItem>,
}

/// One status entry, e.g. a processing error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStatusItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::ProcessingError>,
}

impl Entity {
    /// Create a minimal entity.
    #[must_use]
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: EntityMeta {
                name: name.into(),
                ..EntityMeta::default()
            },
            spec: None,
            relations: Vec::new(),
            incoming_relations: Vec::new(),
            status: None,
            extra: Map::new(),
        }
    }

    /// Builder-style namespace setter.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.namespace = Some(namespace.into());
        self
    }

    /// Builder-style spec setter.
    #[must_use]
    pub fn with_spec(mut self, spec: JsonValue) -> Self {
        self.spec = Some(spec);
        self
    }

    /// The namespace, falling back to the default one.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.metadata
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// The canonical ref of this entity.
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(&self.kind, self.namespace(), &self.metadata.name)
    }

    /// Look up a string field of `spec`.
    #[must_use]
    pub fn spec_str(&self, field: &str) -> Option<&str> {
        self.spec.as_ref()?.get(field)?.as_str()
    }

    /// Canonical JSON text of this entity.
    pub fn to_canonical_json(&self) -> Result<String, CatalogError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an entity from JSON text.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        Ok(serde_json::from_str(json)?)
    }
}

// =============================================================================
// ENVELOPE VALIDATION
// =============================================================================

/// Check the envelope of an entity: `apiVersion`, `kind`, `metadata.name`
/// and, if present, `metadata.namespace` must be well formed.
///
/// Returns `CatalogError::InvalidEntity` naming the offending field.
pub fn validate_envelope(entity: &Entity) -> Result<(), CatalogError> {
    if !is_valid_api_version(&entity.api_version) {
        return Err(CatalogError::InvalidEntity(format!(
            "apiVersion '{}' is not valid",
            entity.api_version
        )));
    }
    if !is_valid_kind(&entity.kind) {
        return Err(CatalogError::InvalidEntity(format!(
            "kind '{}' is not valid",
            entity.kind
        )));
    }
    if !is_valid_object_name(&entity.metadata.name) {
        return Err(CatalogError::InvalidEntity(format!(
            "metadata.name '{}' is not valid",
            entity.metadata.name
        )));
    }
    if let Some(namespace) = &entity.metadata.namespace {
        if !is_valid_object_name(namespace) {
            return Err(CatalogError::InvalidEntity(format!(
                "metadata.namespace '{}' is not valid",
                namespace
            )));
        }
    }
    Ok(())
}

/// Fill in the default namespace when an entity declares none.
pub fn apply_default_namespace(entity: &mut Entity) {
    if entity.metadata.namespace.as_deref().is_none_or(str::is_empty) {
        entity.metadata.namespace = Some(DEFAULT_NAMESPACE.to_string());
    }
}

/// `[a-z0-9A-Z]` at both ends, `[-_.a-z0-9A-Z]` in between.
fn is_valid_object_name(value: &str) -> bool {
    let bytes = value.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    value.len() <= MAX_NAME_LENGTH
        && first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn is_valid_kind(value: &str) -> bool {
    let mut chars = value.chars();
    value.len() <= MAX_NAME_LENGTH
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

fn is_valid_api_version(value: &str) -> bool {
    if value.is_empty() || value.len() > MAX_API_VERSION_LENGTH {
        return false;
    }
    let mut parts = value.split('/');
    let (first, second, rest) = (parts.next(), parts.next(), parts.next());
    if rest.is_some() {
        return false;
    }
    match (first, second) {
        (Some(version), None) => is_dns_like(version),
        (Some(group), Some(version)) => is_dns_like(group) && is_dns_like(version),
        _ => false,
    }
}

fn is_dns_like(part: &str) -> bool {
    let bytes = part.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.'))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_ref_uses_default_namespace() {
        let entity = Entity::new("tessera.io/v1alpha1", "Component", "Svc");
        assert_eq!(entity.entity_ref().as_str(), "component:default/svc");

        let namespaced = entity.with_namespace("Payments");
        assert_eq!(namespaced.entity_ref().as_str(), "component:payments/svc");
    }

    #[test]
    fn unknown_metadata_fields_survive_round_trip() {
        let raw = json!({
            "apiVersion": "tessera.io/v1alpha1",
            "kind": "Component",
            "metadata": { "name": "svc", "description": "A service", "tags": ["a", "b"] },
            "spec": { "type": "service", "owner": "team-a" }
        });
        let entity: Entity = serde_json::from_value(raw.clone()).expect("parse");
        assert_eq!(
            entity.metadata.extra.get("description"),
            Some(&json!("A service"))
        );

        let text = entity.to_canonical_json().expect("serialize");
        let back = Entity::from_json(&text).expect("parse back");
        assert_eq!(back, entity);
        assert_eq!(serde_json::to_value(&back).expect("value"), raw);
    }

    #[test]
    fn unknown_top_level_fields_survive_round_trip() {
        let raw = json!({
            "apiVersion": "tessera.io/v1alpha1",
            "kind": "Component",
            "metadata": { "name": "svc" },
            "spec": { "type": "service" },
            "x-team": { "slack": "#svc" }
        });
        let entity: Entity = serde_json::from_value(raw.clone()).expect("parse");
        assert_eq!(entity.extra.get("x-team"), Some(&json!({ "slack": "#svc" })));
        assert!(entity.metadata.extra.is_empty());

        let back = Entity::from_json(&entity.to_canonical_json().expect("serialize")).expect("parse back");
        assert_eq!(serde_json::to_value(&back).expect("value"), raw);
    }

    #[test]
    fn validate_accepts_well_formed_envelope() {
        let entity = Entity::new("tessera.io/v1alpha1", "Location", "root").with_namespace("default");
        validate_envelope(&entity).expect("valid");
        validate_envelope(&Entity::new("v1", "Group", "team_a.ops")).expect("valid");
    }

    #[test]
    fn validate_rejects_bad_fields() {
        let cases = [
            Entity::new("", "Component", "svc"),
            Entity::new("a/b/c", "Component", "svc"),
            Entity::new("v1", "1Component", "svc"),
            Entity::new("v1", "Comp-onent", "svc"),
            Entity::new("v1", "Component", ""),
            Entity::new("v1", "Component", "-svc"),
            Entity::new("v1", "Component", "svc name"),
            Entity::new("v1", "Component", "a".repeat(64)),
            Entity::new("v1", "Component", "svc").with_namespace("bad/ns"),
        ];
        for entity in cases {
            let err = validate_envelope(&entity).expect_err("should be rejected");
            assert!(matches!(err, CatalogError::InvalidEntity(_)));
        }
    }

    #[test]
    fn apply_default_namespace_fills_missing_only() {
        let mut entity = Entity::new("v1", "Component", "svc");
        apply_default_namespace(&mut entity);
        assert_eq!(entity.metadata.namespace.as_deref(), Some("default"));

        let mut entity = Entity::new("v1", "Component", "svc").with_namespace("other");
        apply_default_namespace(&mut entity);
        assert_eq!(entity.metadata.namespace.as_deref(), Some("other"));
    }

    #[test]
    fn spec_str_reads_string_fields() {
        let entity =
            Entity::new("v1", "Location", "x").with_spec(json!({ "type": "file", "n": 3 }));
        assert_eq!(entity.spec_str("type"), Some("file"));
        assert_eq!(entity.spec_str("n"), None);
        assert_eq!(entity.spec_str("missing"), None);
    }
}
