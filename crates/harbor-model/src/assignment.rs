//! Address assignments: ties between service endpoints and IPs.

use serde::{Deserialize, Serialize};

use crate::{HostId, PoolId, ServiceId};

/// Whether an assigned IP belongs to a specific host or to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    /// A host's statically configured IP; `host_id` names the owner.
    Static,
    /// A pool virtual IP; `host_id` is empty.
    Virtual,
}

/// An IP assignment for one endpoint of one service.
///
/// At most one assignment exists per `(service_id, endpoint_name)`. For
/// virtual assignments the IP must be registered in the pool's virtual IPs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressAssignment {
    pub id: String,
    pub service_id: ServiceId,
    pub endpoint_name: String,
    pub ip: String,
    pub port: u16,
    pub assignment_type: AssignmentType,
    /// Empty for virtual assignments.
    #[serde(default)]
    pub host_id: HostId,
    pub pool_id: PoolId,
}

impl AddressAssignment {
    /// Catalog key enforcing the one-per-endpoint invariant.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.service_id, self.endpoint_name)
    }
}

/// A request to assign IPs to a service subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRequest {
    pub service_id: ServiceId,
    /// Ignored when `auto_assignment` is set.
    #[serde(default)]
    pub ip_address: String,
    pub auto_assignment: bool,
}
