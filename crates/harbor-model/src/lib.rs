//! Domain model for the Harbor control plane.
//!
//! These types represent the persisted state of pools, hosts, services,
//! endpoints, address assignments, and scheduled instances. All types are
//! serializable to/from JSON for storage in the catalog and for publication
//! into the coordination namespace.

pub mod application;
pub mod assignment;
pub mod error;
pub mod host;
pub mod service;
pub mod state;
pub mod tree;
pub mod user;

pub use application::{ApplicationEndpoint, MuxSource};
pub use assignment::{AddressAssignment, AssignmentRequest, AssignmentType};
pub use error::{ErrorKind, ModelError};
pub use host::{Host, HostResources, Pool, VirtualIp};
pub use service::{
    AddressConfig, ConfigFile, DesiredState, Endpoint, Launch, LogConfig, LogTag, Protocol,
    Purpose, Service,
};
pub use state::{HostIpAndPort, HostState, ServiceState};
pub use user::{User, SYSTEM_USER_NAME};

/// Unique identifier for a service.
pub type ServiceId = String;

/// Unique identifier for a host.
pub type HostId = String;

/// Unique identifier for a resource pool.
pub type PoolId = String;
