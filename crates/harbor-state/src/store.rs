//! Catalog — typed CRUD over services, hosts, pools, config revisions,
//! address assignments, and users.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use harbor_model::{AddressAssignment, ConfigFile, Host, Pool, Service, User};

use crate::error::{CatalogError, CatalogResult};
use crate::tables::*;

/// Convert any `Display` error into a `CatalogError` variant via a closure
/// factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| CatalogError::$variant(e.to_string())
    };
}

/// Thread-safe catalog backed by redb.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
}

impl Catalog {
    /// Open (or create) a persistent catalog at the given path.
    pub fn open(path: &Path) -> CatalogResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let catalog = Self { db: Arc::new(db) };
        catalog.ensure_tables()?;
        debug!(?path, "catalog opened");
        Ok(catalog)
    }

    /// Create an ephemeral in-memory catalog (for testing and standalone
    /// experiments).
    pub fn open_in_memory() -> CatalogResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let catalog = Self { db: Arc::new(db) };
        catalog.ensure_tables()?;
        debug!("in-memory catalog opened");
        Ok(catalog)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> CatalogResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.open_table(HOSTS).map_err(map_err!(Table))?;
        txn.open_table(POOLS).map_err(map_err!(Table))?;
        txn.open_table(CONFIG_REVISIONS).map_err(map_err!(Table))?;
        txn.open_table(ASSIGNMENTS).map_err(map_err!(Table))?;
        txn.open_table(USERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic plumbing ───────────────────────────────────────────

    fn put_raw<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> CatalogResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_raw<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> CatalogResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn delete_raw(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> CatalogResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Collect every value in `table` whose key starts with `prefix`
    /// (empty prefix scans the whole table), in key order.
    fn scan_prefix<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> CatalogResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or update a service.
    pub fn put_service(&self, svc: &Service) -> CatalogResult<()> {
        self.put_raw(SERVICES, &svc.id, svc)?;
        debug!(service = %svc.id, "service stored");
        Ok(())
    }

    /// Get a service by id.
    pub fn get_service(&self, id: &str) -> CatalogResult<Option<Service>> {
        self.get_raw(SERVICES, id)
    }

    /// Get a service by id, failing if it does not exist.
    pub fn require_service(&self, id: &str) -> CatalogResult<Service> {
        self.get_service(id)?
            .ok_or_else(|| CatalogError::NotFound(format!("service {id}")))
    }

    /// Delete a service by id. Returns true if it existed.
    pub fn delete_service(&self, id: &str) -> CatalogResult<bool> {
        let existed = self.delete_raw(SERVICES, id)?;
        debug!(service = %id, existed, "service deleted");
        Ok(existed)
    }

    /// List all services.
    pub fn all_services(&self) -> CatalogResult<Vec<Service>> {
        self.scan_prefix(SERVICES, "")
    }

    /// List direct children of a service (secondary index scan).
    pub fn child_services(&self, parent_id: &str) -> CatalogResult<Vec<Service>> {
        let mut children: Vec<Service> = self
            .all_services()?
            .into_iter()
            .filter(|s| s.parent_id == parent_id)
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(children)
    }

    /// List services assigned to a pool.
    pub fn services_in_pool(&self, pool_id: &str) -> CatalogResult<Vec<Service>> {
        Ok(self
            .all_services()?
            .into_iter()
            .filter(|s| s.pool_id == pool_id)
            .collect())
    }

    /// List services carrying every one of the given tags.
    pub fn query_services(&self, tags: &[String]) -> CatalogResult<Vec<Service>> {
        Ok(self
            .all_services()?
            .into_iter()
            .filter(|s| tags.iter().all(|t| s.tags.contains(t)))
            .collect())
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Insert or update a host.
    pub fn put_host(&self, host: &Host) -> CatalogResult<()> {
        self.put_raw(HOSTS, &host.id, host)
    }

    /// Get a host by id.
    pub fn get_host(&self, id: &str) -> CatalogResult<Option<Host>> {
        self.get_raw(HOSTS, id)
    }

    /// Delete a host by id. Returns true if it existed.
    pub fn delete_host(&self, id: &str) -> CatalogResult<bool> {
        self.delete_raw(HOSTS, id)
    }

    /// List all hosts.
    pub fn all_hosts(&self) -> CatalogResult<Vec<Host>> {
        self.scan_prefix(HOSTS, "")
    }

    /// List hosts registered in a pool.
    pub fn hosts_in_pool(&self, pool_id: &str) -> CatalogResult<Vec<Host>> {
        Ok(self
            .all_hosts()?
            .into_iter()
            .filter(|h| h.pool_id == pool_id)
            .collect())
    }

    // ── Pools ──────────────────────────────────────────────────────

    /// Insert or update a pool.
    pub fn put_pool(&self, pool: &Pool) -> CatalogResult<()> {
        self.put_raw(POOLS, &pool.id, pool)
    }

    /// Get a pool by id.
    pub fn get_pool(&self, id: &str) -> CatalogResult<Option<Pool>> {
        self.get_raw(POOLS, id)
    }

    /// Delete a pool by id. Returns true if it existed.
    pub fn delete_pool(&self, id: &str) -> CatalogResult<bool> {
        self.delete_raw(POOLS, id)
    }

    /// List all pools.
    pub fn all_pools(&self) -> CatalogResult<Vec<Pool>> {
        self.scan_prefix(POOLS, "")
    }

    // ── Config-file revisions ──────────────────────────────────────

    /// Append a config-file revision for a service path.
    ///
    /// Revisions are never rewritten: each write is a new row keyed by the
    /// revision's `updated` timestamp.
    pub fn put_config_revision(
        &self,
        tenant_id: &str,
        service_path: &str,
        file: &ConfigFile,
    ) -> CatalogResult<()> {
        let key = revision_key(tenant_id, service_path, &file.filename, file.updated);
        self.put_raw(CONFIG_REVISIONS, &key, file)
    }

    /// The newest non-deleted revision of every config file under a
    /// service path.
    pub fn latest_config_files(
        &self,
        tenant_id: &str,
        service_path: &str,
    ) -> CatalogResult<HashMap<String, ConfigFile>> {
        let prefix = format!("{tenant_id}:{service_path}:");
        let revisions: Vec<ConfigFile> = self.scan_prefix(CONFIG_REVISIONS, &prefix)?;

        // Key order is chronological per file, so later rows win.
        let mut newest: HashMap<String, ConfigFile> = HashMap::new();
        for rev in revisions {
            newest.insert(rev.filename.clone(), rev);
        }
        newest.retain(|_, rev| !rev.deleted);
        Ok(newest)
    }

    /// Full revision history for a service path, chronological.
    pub fn config_history(
        &self,
        tenant_id: &str,
        service_path: &str,
    ) -> CatalogResult<Vec<ConfigFile>> {
        let prefix = format!("{tenant_id}:{service_path}:");
        let mut history: Vec<ConfigFile> = self.scan_prefix(CONFIG_REVISIONS, &prefix)?;
        history.sort_by_key(|rev| rev.updated);
        Ok(history)
    }

    // ── Address assignments ────────────────────────────────────────

    /// Insert or replace the assignment for `(service, endpoint)`.
    ///
    /// Keying by that pair is what enforces the at-most-one invariant.
    pub fn put_assignment(&self, assignment: &AddressAssignment) -> CatalogResult<()> {
        self.put_raw(ASSIGNMENTS, &assignment.table_key(), assignment)
    }

    /// Get the assignment for one endpoint of a service.
    pub fn get_assignment(
        &self,
        service_id: &str,
        endpoint_name: &str,
    ) -> CatalogResult<Option<AddressAssignment>> {
        self.get_raw(ASSIGNMENTS, &format!("{service_id}:{endpoint_name}"))
    }

    /// All assignments held by a service.
    pub fn assignments_for_service(
        &self,
        service_id: &str,
    ) -> CatalogResult<Vec<AddressAssignment>> {
        self.scan_prefix(ASSIGNMENTS, &format!("{service_id}:"))
    }

    /// Delete one endpoint's assignment. Returns true if it existed.
    pub fn delete_assignment(&self, service_id: &str, endpoint_name: &str) -> CatalogResult<bool> {
        self.delete_raw(ASSIGNMENTS, &format!("{service_id}:{endpoint_name}"))
    }

    // ── Users ──────────────────────────────────────────────────────

    /// Insert or update a user.
    pub fn put_user(&self, user: &User) -> CatalogResult<()> {
        self.put_raw(USERS, &user.name, user)
    }

    /// Get a user by name.
    pub fn get_user(&self, name: &str) -> CatalogResult<Option<User>> {
        self.get_raw(USERS, name)
    }

    /// Check a name/password pair against the catalog.
    pub fn validate_credentials(&self, name: &str, password: &str) -> CatalogResult<bool> {
        Ok(self
            .get_user(name)?
            .map(|u| u.password == password)
            .unwrap_or(false))
    }
}

fn revision_key(tenant_id: &str, service_path: &str, filename: &str, updated: u64) -> String {
    // Zero-padded timestamps keep lexicographic key order chronological.
    format!("{tenant_id}:{service_path}:{filename}:{updated:020}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_model::{AssignmentType, DesiredState};

    fn test_service(id: &str, parent: &str) -> Service {
        let mut svc = Service::new(id, "default", id);
        svc.parent_id = parent.to_string();
        svc
    }

    fn test_config(filename: &str, content: &str, updated: u64) -> ConfigFile {
        ConfigFile {
            filename: filename.to_string(),
            content: content.to_string(),
            updated,
            deleted: false,
            commit: String::new(),
        }
    }

    // ── Service CRUD ───────────────────────────────────────────────

    #[test]
    fn service_put_and_get() {
        let catalog = Catalog::open_in_memory().unwrap();
        let mut svc = test_service("svc-1", "");
        svc.desired_state = DesiredState::Run;

        catalog.put_service(&svc).unwrap();
        assert_eq!(catalog.get_service("svc-1").unwrap(), Some(svc));
    }

    #[test]
    fn service_get_nonexistent_returns_none() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert!(catalog.get_service("nope").unwrap().is_none());
    }

    #[test]
    fn service_children_are_indexed_by_parent() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.put_service(&test_service("t", "")).unwrap();
        catalog.put_service(&test_service("a", "t")).unwrap();
        catalog.put_service(&test_service("b", "t")).unwrap();
        catalog.put_service(&test_service("c", "a")).unwrap();

        let kids = catalog.child_services("t").unwrap();
        let ids: Vec<&str> = kids.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn service_query_by_tags() {
        let catalog = Catalog::open_in_memory().unwrap();
        let mut a = test_service("a", "");
        a.tags = vec!["db".to_string(), "prod".to_string()];
        let mut b = test_service("b", "");
        b.tags = vec!["db".to_string()];
        catalog.put_service(&a).unwrap();
        catalog.put_service(&b).unwrap();

        let both = catalog.query_services(&["db".to_string()]).unwrap();
        assert_eq!(both.len(), 2);
        let prod = catalog
            .query_services(&["db".to_string(), "prod".to_string()])
            .unwrap();
        assert_eq!(prod.len(), 1);
        assert_eq!(prod[0].id, "a");
    }

    #[test]
    fn service_delete() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.put_service(&test_service("svc", "")).unwrap();

        assert!(catalog.delete_service("svc").unwrap());
        assert!(!catalog.delete_service("svc").unwrap());
        assert!(catalog.get_service("svc").unwrap().is_none());
    }

    // ── Host and pool CRUD ─────────────────────────────────────────

    #[test]
    fn hosts_indexed_by_pool() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.put_host(&Host::new("h1", "p1", "10.0.0.1")).unwrap();
        catalog.put_host(&Host::new("h2", "p1", "10.0.0.2")).unwrap();
        catalog.put_host(&Host::new("h3", "p2", "10.0.0.3")).unwrap();

        assert_eq!(catalog.hosts_in_pool("p1").unwrap().len(), 2);
        assert_eq!(catalog.hosts_in_pool("p2").unwrap().len(), 1);
        assert!(catalog.hosts_in_pool("p9").unwrap().is_empty());
    }

    #[test]
    fn pool_roundtrip() {
        let catalog = Catalog::open_in_memory().unwrap();
        let pool = Pool::new("default");
        catalog.put_pool(&pool).unwrap();
        assert_eq!(catalog.get_pool("default").unwrap(), Some(pool));
        assert!(catalog.delete_pool("default").unwrap());
    }

    // ── Config revisions ───────────────────────────────────────────

    #[test]
    fn latest_config_compacts_to_newest_per_file() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .put_config_revision("t", "/app", &test_config("a.conf", "v1", 100))
            .unwrap();
        catalog
            .put_config_revision("t", "/app", &test_config("a.conf", "v2", 200))
            .unwrap();
        catalog
            .put_config_revision("t", "/app", &test_config("b.conf", "b1", 150))
            .unwrap();

        let latest = catalog.latest_config_files("t", "/app").unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["a.conf"].content, "v2");
        assert_eq!(latest["b.conf"].content, "b1");
    }

    #[test]
    fn deleted_revision_tombstones_the_file() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .put_config_revision("t", "/app", &test_config("a.conf", "v1", 100))
            .unwrap();
        let mut tombstone = test_config("a.conf", "", 200);
        tombstone.deleted = true;
        catalog
            .put_config_revision("t", "/app", &tombstone)
            .unwrap();

        let latest = catalog.latest_config_files("t", "/app").unwrap();
        assert!(latest.is_empty());

        // History still shows both revisions.
        let history = catalog.config_history("t", "/app").unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[1].deleted);
    }

    #[test]
    fn config_paths_do_not_bleed_across_tenants() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .put_config_revision("t1", "/app", &test_config("a.conf", "one", 100))
            .unwrap();
        catalog
            .put_config_revision("t2", "/app", &test_config("a.conf", "two", 100))
            .unwrap();

        let t1 = catalog.latest_config_files("t1", "/app").unwrap();
        assert_eq!(t1["a.conf"].content, "one");
    }

    // ── Assignments ────────────────────────────────────────────────

    #[test]
    fn one_assignment_per_endpoint() {
        let catalog = Catalog::open_in_memory().unwrap();
        let mut assignment = AddressAssignment {
            id: "a1".to_string(),
            service_id: "svc".to_string(),
            endpoint_name: "pg".to_string(),
            ip: "10.0.0.5".to_string(),
            port: 5432,
            assignment_type: AssignmentType::Static,
            host_id: "h1".to_string(),
            pool_id: "default".to_string(),
        };
        catalog.put_assignment(&assignment).unwrap();

        // Same endpoint again replaces, never duplicates.
        assignment.id = "a2".to_string();
        assignment.ip = "10.0.0.6".to_string();
        catalog.put_assignment(&assignment).unwrap();

        let all = catalog.assignments_for_service("svc").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ip, "10.0.0.6");

        assert!(catalog.delete_assignment("svc", "pg").unwrap());
        assert!(catalog.get_assignment("svc", "pg").unwrap().is_none());
    }

    // ── Users ──────────────────────────────────────────────────────

    #[test]
    fn credential_validation() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .put_user(&User {
                name: "ops".to_string(),
                password: "hunter2".to_string(),
            })
            .unwrap();

        assert!(catalog.validate_credentials("ops", "hunter2").unwrap());
        assert!(!catalog.validate_credentials("ops", "wrong").unwrap());
        assert!(!catalog.validate_credentials("ghost", "hunter2").unwrap());
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("catalog.redb");

        {
            let catalog = Catalog::open(&db_path).unwrap();
            catalog.put_service(&test_service("svc", "")).unwrap();
        }

        let catalog = Catalog::open(&db_path).unwrap();
        assert!(catalog.get_service("svc").unwrap().is_some());
    }
}
