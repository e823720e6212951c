//! # Primitives
//!
//! Hardcoded constants of the Tessera processing store.
//!
//! These are compiled into the binary. Tunables that operators may want to
//! change (lease, refresh interval) live in `StoreConfig` and only take their
//! defaults from here.

use std::time::Duration;

/// Namespace assigned to entities that do not declare one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default lease applied by a claim.
///
/// A claimed row is not offered again until this much time has passed,
/// unless the processing pass reschedules it first.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(10);

/// Default delay between two processing passes of the same entity.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(100);

// =============================================================================
// ENVELOPE LIMITS
// =============================================================================

/// Maximum length of `kind`, `metadata.name` and `metadata.namespace`.
pub const MAX_NAME_LENGTH: usize = 63;

/// Maximum length of `apiVersion`.
pub const MAX_API_VERSION_LENGTH: usize = 253;

// =============================================================================
// SEARCH INDEX LIMITS
// =============================================================================

/// Values longer than this are left out of the search index.
pub const MAX_SEARCH_VALUE_LENGTH: usize = 200;

/// Keys longer than this are left out of the search index.
pub const MAX_SEARCH_KEY_LENGTH: usize = 200;

// =============================================================================
// WELL-KNOWN ANNOTATIONS AND TYPES
// =============================================================================

/// Annotation naming the location an entity was read from.
pub const MANAGED_BY_LOCATION_ANNOTATION: &str = "tessera.io/managed-by-location";

/// API version stamped on generated Location entities.
pub const LOCATION_API_VERSION: &str = "tessera.io/v1alpha1";

/// Status item type used for processing errors on stitched entities.
pub const PROCESSING_STATUS_TYPE: &str = "tessera.io/catalog-processing";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_shorter_than_refresh() {
        assert!(DEFAULT_LEASE_DURATION < DEFAULT_REFRESH_INTERVAL);
    }

    #[test]
    fn default_namespace_is_lowercase() {
        assert_eq!(DEFAULT_NAMESPACE, DEFAULT_NAMESPACE.to_lowercase());
    }
}
