//! redb table definitions for the catalog.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys are colon-joined; config revisions zero-pad the
//! timestamp so lexicographic order is chronological.

use redb::TableDefinition;

/// Services keyed by `{service_id}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Hosts keyed by `{host_id}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Pools keyed by `{pool_id}`.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

/// Config-file revisions keyed by
/// `{tenant_id}:{service_path}:{filename}:{updated:020}`.
pub const CONFIG_REVISIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("config_revisions");

/// Address assignments keyed by `{service_id}:{endpoint_name}`.
pub const ASSIGNMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("assignments");

/// Users keyed by `{name}`.
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
