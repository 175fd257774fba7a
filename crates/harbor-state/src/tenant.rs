//! Memoized tenant lookup.
//!
//! The tenant of a service is the root of its subtree, reached by walking
//! `parent_id` links. Lookups are memoized per process in a registry object
//! injected into consumers (no process-wide statics); the memo is
//! invalidated when a service is re-parented.

use std::collections::HashMap;
use std::sync::RwLock;

use harbor_model::ServiceId;

use crate::error::{CatalogError, CatalogResult};
use crate::store::Catalog;

/// Cache of `{service_id -> tenant_id}`.
#[derive(Default)]
pub struct TenantCache {
    map: RwLock<HashMap<ServiceId, ServiceId>>,
}

impl TenantCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the tenant of `service_id`, walking and memoizing the path
    /// from this service up to its root.
    pub fn tenant_of(&self, catalog: &Catalog, service_id: &str) -> CatalogResult<ServiceId> {
        if let Some(tenant) = self.lookup(service_id) {
            return Ok(tenant);
        }

        let mut visited = Vec::new();
        let mut svc = catalog.require_service(service_id)?;
        visited.push(svc.id.clone());
        let tenant = loop {
            if svc.parent_id.is_empty() {
                break svc.id.clone();
            }
            if let Some(tenant) = self.lookup(&svc.parent_id) {
                break tenant;
            }
            svc = catalog.require_service(&svc.parent_id)?;
            visited.push(svc.id.clone());
        };

        let mut map = self.map.write().expect("tenant cache lock");
        for id in visited {
            map.insert(id, tenant.clone());
        }
        Ok(tenant)
    }

    /// Drop every memoized entry.
    ///
    /// Called when a service is re-parented: descendants of the moved node
    /// are not enumerable from the cache alone, so the whole memo goes.
    pub fn invalidate(&self) {
        self.map.write().expect("tenant cache lock").clear();
    }

    fn lookup(&self, service_id: &str) -> Option<ServiceId> {
        self.map
            .read()
            .expect("tenant cache lock")
            .get(service_id)
            .cloned()
    }
}

impl std::fmt::Debug for TenantCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.map.read().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("TenantCache").field("entries", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_model::Service;

    fn seed_tree(catalog: &Catalog) {
        let tenant = Service::new("t", "default", "tenant");
        let mut mid = Service::new("m", "default", "middle");
        mid.parent_id = "t".to_string();
        let mut leaf = Service::new("l", "default", "leaf");
        leaf.parent_id = "m".to_string();
        for svc in [tenant, mid, leaf] {
            catalog.put_service(&svc).unwrap();
        }
    }

    #[test]
    fn resolves_and_memoizes() {
        let catalog = Catalog::open_in_memory().unwrap();
        seed_tree(&catalog);
        let cache = TenantCache::new();

        assert_eq!(cache.tenant_of(&catalog, "l").unwrap(), "t");
        // The walk memoized every node on the path.
        assert_eq!(cache.lookup("m"), Some("t".to_string()));
        assert_eq!(cache.lookup("t"), Some("t".to_string()));
    }

    #[test]
    fn tenant_is_a_fixed_point() {
        let catalog = Catalog::open_in_memory().unwrap();
        seed_tree(&catalog);
        let cache = TenantCache::new();

        let tenant = cache.tenant_of(&catalog, "l").unwrap();
        assert_eq!(cache.tenant_of(&catalog, &tenant).unwrap(), tenant);
    }

    #[test]
    fn invalidate_forces_a_fresh_walk() {
        let catalog = Catalog::open_in_memory().unwrap();
        seed_tree(&catalog);
        let cache = TenantCache::new();
        assert_eq!(cache.tenant_of(&catalog, "l").unwrap(), "t");

        // Re-parent the middle node to a new root.
        catalog.put_service(&Service::new("t2", "default", "other")).unwrap();
        let mut mid = catalog.get_service("m").unwrap().unwrap();
        mid.parent_id = "t2".to_string();
        catalog.put_service(&mid).unwrap();

        cache.invalidate();
        assert_eq!(cache.tenant_of(&catalog, "l").unwrap(), "t2");
    }

    #[test]
    fn missing_service_is_not_found() {
        let catalog = Catalog::open_in_memory().unwrap();
        let cache = TenantCache::new();
        let err = cache.tenant_of(&catalog, "ghost").unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }
}
