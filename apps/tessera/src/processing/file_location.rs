//! File-backed `Location` entities.
//!
//! A `Location` with `spec.type: file` points at a JSON or YAML file of
//! entity definitions. Every entity found there is emitted as a deferred
//! entity of the location, so removing the file (or an entry from it)
//! lets the reference graph prune what it used to produce.

use super::{CatalogProcessor, ProcessorContext, ProcessorError};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::path::{Path, PathBuf};
use tessera_core::Entity;
use tessera_core::primitives::MANAGED_BY_LOCATION_ANNOTATION;

/// Reads entity definitions from files named by `Location` entities.
#[derive(Debug, Clone)]
pub struct FileLocationProcessor {
    base_dir: PathBuf,
}

impl FileLocationProcessor {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn read_target(&self, target: &str) -> Result<(PathBuf, Vec<u8>), ProcessorError> {
        let path = self.base_dir.join(target);
        match std::fs::read(&path) {
            Ok(bytes) => Ok((path, bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ProcessorError::NotFound(
                format!("{} does not exist", path.display()),
            )),
            Err(e) => Err(ProcessorError::Io(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }
}

impl CatalogProcessor for FileLocationProcessor {
    fn name(&self) -> &str {
        "file-location"
    }

    fn process(&self, entity: &Entity, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
        if !entity.kind.eq_ignore_ascii_case("location") || entity.spec_str("type") != Some("file") {
            return Ok(());
        }
        let target = entity
            .spec_str("target")
            .ok_or_else(|| ProcessorError::Input("Location has no spec.target".to_string()))?;

        let (path, bytes) = self.read_target(target)?;
        let digest = blake3::hash(&bytes).to_hex().to_string();

        let cached = ctx
            .cached()
            .filter(|c| c.get("digest").and_then(JsonValue::as_str) == Some(digest.as_str()))
            .and_then(|c| c.get("entities"))
            .and_then(|e| serde_json::from_value::<Vec<Entity>>(e.clone()).ok());

        let entities = match cached {
            Some(entities) => entities,
            None => {
                let mut entities = parse_entities(&path, &bytes)?;
                let location = format!("file:{target}");
                for e in &mut entities {
                    e.metadata
                        .annotations
                        .insert(MANAGED_BY_LOCATION_ANNOTATION.to_string(), location.clone());
                }
                entities
            }
        };

        ctx.set_cache(json!({ "digest": digest, "entities": entities }));
        for e in entities {
            ctx.emit_entity(e);
        }
        Ok(())
    }
}

/// `.json` files hold one entity or an array of them; anything else is
/// read as (multi-document) YAML, where a document may also be a list.
pub(crate) fn parse_entities(path: &Path, bytes: &[u8]) -> Result<Vec<Entity>, ProcessorError> {
    let invalid = |e: &dyn std::fmt::Display| {
        ProcessorError::Input(format!("failed to parse {}: {e}", path.display()))
    };

    if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
        let value: JsonValue = serde_json::from_slice(bytes).map_err(|e| invalid(&e))?;
        return match value {
            JsonValue::Array(items) => items
                .into_iter()
                .map(|v| serde_json::from_value(v).map_err(|e| invalid(&e)))
                .collect(),
            other => Ok(vec![serde_json::from_value(other).map_err(|e| invalid(&e))?]),
        };
    }

    let mut entities = Vec::new();
    for document in serde_yaml::Deserializer::from_slice(bytes) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| invalid(&e))?;
        match value {
            serde_yaml::Value::Null => {}
            serde_yaml::Value::Sequence(items) => {
                for item in items {
                    entities.push(serde_yaml::from_value(item).map_err(|e| invalid(&e))?);
                }
            }
            other => entities.push(serde_yaml::from_value(other).map_err(|e| invalid(&e))?),
        }
    }
    Ok(entities)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::tempdir;

    fn location(target: &str) -> Entity {
        Entity::new("tessera.io/v1alpha1", "Location", "catalog")
            .with_namespace("default")
            .with_spec(json!({ "type": "file", "target": target }))
    }

    const YAML: &str = "\
apiVersion: tessera.io/v1alpha1
kind: Component
metadata:
  name: web
spec:
  owner: team-a
---
apiVersion: tessera.io/v1alpha1
kind: Group
metadata:
  name: team-a
";

    #[test]
    fn yaml_documents_become_deferred_entities() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("catalog.yaml"), YAML).expect("write");

        let processor = FileLocationProcessor::new(dir.path());
        let previous = Map::new();
        let mut ctx = ProcessorContext::new(&previous);
        ctx.enter(processor.name());
        processor
            .process(&location("catalog.yaml"), &mut ctx)
            .expect("process");

        let names: Vec<&str> = ctx.deferred().iter().map(|e| e.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["web", "team-a"]);
        assert_eq!(
            ctx.deferred()[0].metadata.annotations.get(MANAGED_BY_LOCATION_ANNOTATION),
            Some(&"file:catalog.yaml".to_string())
        );
    }

    #[test]
    fn unknown_yaml_keys_are_kept() {
        let dir = tempdir().expect("tempdir");
        let body = "apiVersion: v1\nkind: Component\nmetadata:\n  name: web\nlifecycle: beta\n";
        std::fs::write(dir.path().join("web.yaml"), body).expect("write");

        let processor = FileLocationProcessor::new(dir.path());
        let previous = Map::new();
        let mut ctx = ProcessorContext::new(&previous);
        processor.process(&location("web.yaml"), &mut ctx).expect("process");
        assert_eq!(ctx.deferred()[0].extra.get("lifecycle"), Some(&json!("beta")));
    }

    #[test]
    fn json_array_is_accepted() {
        let dir = tempdir().expect("tempdir");
        let body = json!([
            { "apiVersion": "v1", "kind": "Component", "metadata": { "name": "a" } },
            { "apiVersion": "v1", "kind": "Component", "metadata": { "name": "b" } },
        ]);
        std::fs::write(dir.path().join("all.json"), body.to_string()).expect("write");

        let processor = FileLocationProcessor::new(dir.path());
        let previous = Map::new();
        let mut ctx = ProcessorContext::new(&previous);
        processor.process(&location("all.json"), &mut ctx).expect("process");
        assert_eq!(ctx.deferred().len(), 2);
    }

    #[test]
    fn unchanged_file_is_served_from_cache() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.yaml");
        std::fs::write(&path, YAML).expect("write");
        let digest = blake3::hash(YAML.as_bytes()).to_hex().to_string();

        // A cache entry with the current digest wins over the file content.
        let cached = vec![Entity::new("v1", "Component", "from-cache")];
        let mut previous = Map::new();
        previous.insert(
            "file-location".to_string(),
            json!({ "digest": digest, "entities": cached }),
        );

        let processor = FileLocationProcessor::new(dir.path());
        let mut ctx = ProcessorContext::new(&previous);
        ctx.enter(processor.name());
        processor
            .process(&location("catalog.yaml"), &mut ctx)
            .expect("process");
        assert_eq!(ctx.deferred().len(), 1);
        assert_eq!(ctx.deferred()[0].metadata.name, "from-cache");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let processor = FileLocationProcessor::new(dir.path());
        let previous = Map::new();
        let mut ctx = ProcessorContext::new(&previous);
        let err = processor
            .process(&location("nope.yaml"), &mut ctx)
            .expect_err("missing");
        assert_eq!(err.name(), "NotFoundError");
    }

    #[test]
    fn other_location_types_are_ignored() {
        let processor = FileLocationProcessor::new(".");
        let previous = Map::new();
        let mut ctx = ProcessorContext::new(&previous);
        let url = Entity::new("tessera.io/v1alpha1", "Location", "remote")
            .with_spec(json!({ "type": "url", "target": "https://example.com/catalog.yaml" }));
        processor.process(&url, &mut ctx).expect("process");
        assert!(ctx.deferred().is_empty());
    }
}
