//! The coordination namespace layout.
//!
//! Pool-scoped state lives under `/pools/<poolID>`; election nodes, vhost
//! claims, and storage presence live at the root.

/// Root of one pool's namespace.
pub fn pool_root(pool_id: &str) -> String {
    format!("/pools/{pool_id}")
}

/// Directory of published service definitions in a pool.
pub fn services_dir(pool_id: &str) -> String {
    format!("/pools/{pool_id}/services")
}

/// One published service definition.
pub fn service_node(pool_id: &str, service_id: &str) -> String {
    format!("/pools/{pool_id}/services/{service_id}")
}

/// One service-state child of a service node.
pub fn service_state_node(pool_id: &str, service_id: &str, state_id: &str) -> String {
    format!("/pools/{pool_id}/services/{service_id}/{state_id}")
}

/// Directory of host registrations in a pool.
pub fn hosts_dir(pool_id: &str) -> String {
    format!("/pools/{pool_id}/hosts")
}

/// One host registration node.
pub fn host_node(pool_id: &str, host_id: &str) -> String {
    format!("/pools/{pool_id}/hosts/{host_id}")
}

/// The ephemeral presence child marking a host's agent as alive.
pub fn host_presence_node(pool_id: &str, host_id: &str) -> String {
    format!("/pools/{pool_id}/hosts/{host_id}/{PRESENCE_CHILD}")
}

/// One host-state child (desired state of one instance on the host).
pub fn host_state_node(pool_id: &str, host_id: &str, state_id: &str) -> String {
    format!("/pools/{pool_id}/hosts/{host_id}/{state_id}")
}

/// Child name reserved for agent presence under a host node. Everything
/// else under a host node is a state id.
pub const PRESENCE_CHILD: &str = "online";

/// Per-pool virtual-IP ownership node.
pub fn virtual_ip_node(pool_id: &str, ip: &str) -> String {
    format!("/pools/{pool_id}/virtualips/{ip}")
}

/// Election node for a pool's scheduler leader.
pub fn scheduler_leader(pool_id: &str) -> String {
    format!("/scheduler/leader/{pool_id}")
}

/// Directory of live claims for one vhost name.
pub fn vhost_dir(vhost: &str) -> String {
    format!("/vhosts/{vhost}")
}

/// One ephemeral vhost claim.
pub fn vhost_claim(vhost: &str, claim_id: &str) -> String {
    format!("/vhosts/{vhost}/{claim_id}")
}

/// The storage leader's readiness node.
pub fn storage_leader() -> String {
    "/storage/leader".to_string()
}

/// Ephemeral presence of one storage client.
pub fn storage_client(host_ip: &str) -> String {
    format!("/storage/clients/{host_ip}")
}
