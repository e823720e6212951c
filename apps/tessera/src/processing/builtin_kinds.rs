//! Relations derived from well-known spec fields.
//!
//! | Field | Applies to | Relation pair | Default target kind |
//! |---|---|---|---|
//! | `spec.owner` | any | `ownedBy` / `ownerOf` | `group` |
//! | `spec.system` | any | `partOf` / `hasPart` | `system` |
//! | `spec.dependsOn` | any | `dependsOn` / `dependencyOf` | `component` |
//! | `spec.parent` | `Group` | `childOf` / `parentOf` | `group` |
//! | `spec.memberOf` | `User` | `memberOf` / `hasMember` | `group` |
//!
//! Targets are refs in `kind:namespace/name` form; kind and namespace may be
//! left out, in which case the default kind and the entity's own namespace
//! are used.

use super::{CatalogProcessor, ProcessorContext, ProcessorError};
use serde_json::Value as JsonValue;
use tessera_core::{Entity, EntityName, EntityRelationSpec};

/// Emits paired relations for the built-in kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinKindsProcessor;

struct RelationField {
    field: &'static str,
    /// Only applies to this kind when set.
    kind: Option<&'static str>,
    forward: &'static str,
    reverse: &'static str,
    default_kind: &'static str,
}

const RELATION_FIELDS: &[RelationField] = &[
    RelationField {
        field: "owner",
        kind: None,
        forward: "ownedBy",
        reverse: "ownerOf",
        default_kind: "group",
    },
    RelationField {
        field: "system",
        kind: None,
        forward: "partOf",
        reverse: "hasPart",
        default_kind: "system",
    },
    RelationField {
        field: "dependsOn",
        kind: None,
        forward: "dependsOn",
        reverse: "dependencyOf",
        default_kind: "component",
    },
    RelationField {
        field: "parent",
        kind: Some("group"),
        forward: "childOf",
        reverse: "parentOf",
        default_kind: "group",
    },
    RelationField {
        field: "memberOf",
        kind: Some("user"),
        forward: "memberOf",
        reverse: "hasMember",
        default_kind: "group",
    },
];

impl CatalogProcessor for BuiltinKindsProcessor {
    fn name(&self) -> &str {
        "builtin-kinds"
    }

    fn process(&self, entity: &Entity, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
        let Some(spec) = entity.spec.as_ref() else {
            return Ok(());
        };
        let me = EntityName::new(&entity.kind, entity.namespace(), &entity.metadata.name);

        for rel in RELATION_FIELDS {
            if rel.kind.is_some_and(|k| !entity.kind.eq_ignore_ascii_case(k)) {
                continue;
            }
            let Some(value) = spec.get(rel.field) else {
                continue;
            };
            for target in targets(rel.field, value)? {
                let target = parse_target(target, rel.default_kind, entity.namespace())?;
                ctx.emit_relation(EntityRelationSpec::new(me.clone(), rel.forward, target.clone()));
                ctx.emit_relation(EntityRelationSpec::new(target, rel.reverse, me.clone()));
            }
        }
        Ok(())
    }
}

/// A field holds one ref or a list of refs.
fn targets<'v>(field: &str, value: &'v JsonValue) -> Result<Vec<&'v str>, ProcessorError> {
    let wrong = || ProcessorError::Input(format!("spec.{field} must be a string or a list of strings"));
    match value {
        JsonValue::Null => Ok(Vec::new()),
        JsonValue::String(s) => Ok(vec![s.as_str()]),
        JsonValue::Array(items) => items.iter().map(|i| i.as_str().ok_or_else(wrong)).collect(),
        _ => Err(wrong()),
    }
}

/// Parse `[kind:][namespace/]name`.
fn parse_target(value: &str, default_kind: &str, default_namespace: &str) -> Result<EntityName, ProcessorError> {
    let (kind, rest) = match value.split_once(':') {
        Some((kind, rest)) => (kind, rest),
        None => (default_kind, value),
    };
    let (namespace, name) = match rest.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => (default_namespace, rest),
    };
    if kind.is_empty() || namespace.is_empty() || name.is_empty() || name.contains('/') {
        return Err(ProcessorError::Input(format!("invalid entity reference '{value}'")));
    }
    Ok(EntityName::new(kind.to_lowercase(), namespace, name))
}
