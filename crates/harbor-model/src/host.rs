//! Pools and hosts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{HostId, PoolId};

/// A logical group of hosts sharing a coordination namespace and a
/// virtual-IP allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    /// Aggregate CPU core limit across the pool (0 = unlimited).
    pub core_limit: u32,
    /// Aggregate memory limit across the pool in bytes (0 = unlimited).
    pub memory_limit: u64,
    /// Virtual IPs assignable to endpoints in this pool.
    pub virtual_ips: Vec<VirtualIp>,
}

impl Pool {
    pub fn new(id: impl Into<PoolId>) -> Self {
        Self {
            id: id.into(),
            core_limit: 0,
            memory_limit: 0,
            virtual_ips: Vec::new(),
        }
    }
}

/// A pool-owned IP address not bound to a specific host interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualIp {
    pub ip: String,
    pub netmask: String,
    /// Interface the alias is bound on by the elected owner.
    pub bind_interface: String,
}

/// CPU and memory capacity of a host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct HostResources {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
}

/// A machine able to run service instances.
///
/// Hosts are registered by the agent running on them; liveness is tracked
/// by an ephemeral presence node under the host's coordination path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub pool_id: PoolId,
    pub ip: String,
    pub rpc_port: u16,
    pub resources: HostResources,
    /// Statically configured IPs usable for address assignment.
    pub static_ips: Vec<String>,
    /// Arbitrary labels (rack, zone, ...).
    pub labels: HashMap<String, String>,
}

impl Host {
    pub fn new(id: impl Into<HostId>, pool_id: impl Into<PoolId>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pool_id: pool_id.into(),
            ip: ip.into(),
            rpc_port: 0,
            resources: HostResources::default(),
            static_ips: Vec::new(),
            labels: HashMap::new(),
        }
    }
}
