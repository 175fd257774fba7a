//! Services: nodes in the hierarchical application tree.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::assignment::AddressAssignment;
use crate::{PoolId, ServiceId};

/// What the control plane should converge an entity toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Run,
    Stop,
    Pause,
}

/// Whether the scheduler launches the service automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Launch {
    Auto,
    Manual,
}

/// Transport protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Direction of an endpoint declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Export,
    Import,
}

/// Port/protocol requirements that force an IP assignment for an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressConfig {
    pub port: u16,
    pub protocol: Protocol,
}

/// A named port a service exports to, or imports from, the rest of the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    /// Effective application pattern exporters are matched against.
    pub application: String,
    /// Template evaluated per instance to produce `application`.
    #[serde(default)]
    pub application_template: String,
    pub purpose: Purpose,
    pub protocol: Protocol,
    pub port_number: u16,
    /// Loopback alias name registered inside importing containers.
    #[serde(default)]
    pub virtual_address: String,
    /// Virtual HTTP host names claimed by this endpoint while running.
    #[serde(default)]
    pub vhosts: Vec<String>,
    /// Present when the endpoint requires a stable IP assignment.
    #[serde(default)]
    pub address_config: Option<AddressConfig>,
    /// Filled in from the catalog when the service is fetched.
    #[serde(default)]
    pub address_assignment: Option<AddressAssignment>,
}

impl Endpoint {
    pub fn export(name: impl Into<String>, application: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            application: application.into(),
            application_template: String::new(),
            purpose: Purpose::Export,
            protocol: Protocol::Tcp,
            port_number: port,
            virtual_address: String::new(),
            vhosts: Vec::new(),
            address_config: None,
            address_assignment: None,
        }
    }

    pub fn import(name: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            purpose: Purpose::Import,
            port_number: 0,
            ..Self::export(name, application, 0)
        }
    }

    /// Whether this endpoint requires an IP assignment before starting.
    pub fn needs_assignment(&self) -> bool {
        self.address_config.is_some()
    }
}

/// One tagged dimension of a log configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogTag {
    pub name: String,
    pub value: String,
}

/// Where a service writes a log stream and how it is classified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    pub path: String,
    #[serde(rename = "type")]
    pub log_type: String,
    #[serde(default)]
    pub log_tags: Vec<LogTag>,
}

/// A configuration file attached to a service.
///
/// Each write produces a new revision; queries compact to the newest
/// non-deleted revision per filename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub filename: String,
    pub content: String,
    /// Unix timestamp (seconds) of this revision.
    #[serde(default)]
    pub updated: u64,
    /// Tombstone marker for a removed file.
    #[serde(default)]
    pub deleted: bool,
    /// Free-text change note.
    #[serde(default)]
    pub commit: String,
}

/// A node in the service tree.
///
/// The root of a subtree is the tenant; descendants inherit its id. The
/// tree is acyclic by construction: `parent_id` is either empty or refers
/// to an existing service, and re-parenting is re-validated on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    /// Empty for a tenant root.
    #[serde(default)]
    pub parent_id: ServiceId,
    pub pool_id: PoolId,
    pub name: String,
    /// Command template launched for each instance.
    #[serde(default)]
    pub startup: String,
    /// Named auxiliary command templates.
    #[serde(default)]
    pub runs: HashMap<String, String>,
    /// Named operator action templates.
    #[serde(default)]
    pub actions: HashMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub log_configs: Vec<LogConfig>,
    /// Desired instance count.
    pub instances: u32,
    pub desired_state: DesiredState,
    pub launch: Launch,
    #[serde(default)]
    pub config_files: HashMap<String, ConfigFile>,
    /// Memory reserved per instance, in bytes.
    #[serde(default)]
    pub ram_commitment: u64,
    /// Opaque JSON bag referenced by templates via the `context` accessor.
    #[serde(default)]
    pub context: String,
    /// Free-form query tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Service {
    pub fn new(id: impl Into<ServiceId>, pool_id: impl Into<PoolId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: String::new(),
            pool_id: pool_id.into(),
            name: name.into(),
            startup: String::new(),
            runs: HashMap::new(),
            actions: HashMap::new(),
            endpoints: Vec::new(),
            log_configs: Vec::new(),
            instances: 1,
            desired_state: DesiredState::Stop,
            launch: Launch::Auto,
            config_files: HashMap::new(),
            ram_commitment: 0,
            context: String::new(),
            tags: Vec::new(),
        }
    }

    /// Endpoints this service imports from elsewhere in the tree.
    pub fn imports(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.purpose == Purpose::Import)
    }

    /// Endpoints this service exports.
    pub fn exports(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.purpose == Purpose::Export)
    }

    /// Endpoints declaring at least one virtual host.
    pub fn vhost_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| !e.vhosts.is_empty())
    }

    /// Attach an address assignment to the named endpoint.
    pub fn set_assignment(&mut self, assignment: AddressAssignment) {
        for ep in &mut self.endpoints {
            if ep.name == assignment.endpoint_name {
                ep.address_assignment = Some(assignment);
                return;
            }
        }
    }

    /// Drop any assignment held by the named endpoint.
    pub fn remove_assignment(&mut self, endpoint_name: &str) {
        for ep in &mut self.endpoints {
            if ep.name == endpoint_name {
                ep.address_assignment = None;
            }
        }
    }

    /// Whether this service is a tenant root.
    pub fn is_tenant(&self) -> bool {
        self.parent_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_export_filters() {
        let mut svc = Service::new("s1", "default", "db");
        svc.endpoints.push(Endpoint::export("pg", "postgres", 5432));
        svc.endpoints.push(Endpoint::import("zk", "zookeeper"));

        assert_eq!(svc.exports().count(), 1);
        assert_eq!(svc.imports().count(), 1);
        assert_eq!(svc.imports().next().unwrap().name, "zk");
    }

    #[test]
    fn assignment_attach_and_remove() {
        let mut svc = Service::new("s1", "default", "db");
        let mut ep = Endpoint::export("pg", "postgres", 5432);
        ep.address_config = Some(AddressConfig {
            port: 5432,
            protocol: Protocol::Tcp,
        });
        svc.endpoints.push(ep);

        let assignment = AddressAssignment {
            id: "a1".to_string(),
            service_id: "s1".to_string(),
            endpoint_name: "pg".to_string(),
            ip: "10.0.0.5".to_string(),
            port: 5432,
            assignment_type: crate::AssignmentType::Static,
            host_id: "h1".to_string(),
            pool_id: "default".to_string(),
        };
        svc.set_assignment(assignment.clone());
        assert_eq!(
            svc.endpoints[0].address_assignment.as_ref().unwrap().ip,
            "10.0.0.5"
        );

        svc.remove_assignment("pg");
        assert!(svc.endpoints[0].address_assignment.is_none());
    }

    #[test]
    fn service_roundtrips_through_json() {
        let mut svc = Service::new("s1", "default", "app");
        svc.startup = "run --port {{(context .).port}}".to_string();
        svc.context = r#"{"port": 8080}"#.to_string();
        svc.instances = 3;
        svc.desired_state = DesiredState::Run;

        let bytes = serde_json::to_vec(&svc).unwrap();
        let back: Service = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, svc);
    }
}
