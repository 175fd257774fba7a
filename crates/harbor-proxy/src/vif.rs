//! Virtual-interface registry.
//!
//! Importing containers can reach an endpoint through a stable virtual
//! address instead of a rotating remote. Each unique `(address, port,
//! protocol)` is registered once; the backend that actually plumbs the
//! loopback alias is a capability injected by the daemon.

use std::collections::HashSet;
use std::sync::Mutex;

use harbor_model::Protocol;
use tracing::{debug, info};

/// The side effect performed for a fresh registration.
pub trait VifBackend: Send + Sync {
    fn add_alias(&self, virtual_address: &str, port: u16, protocol: Protocol)
        -> std::io::Result<()>;
}

/// A backend that records the alias in the log only.
///
/// The loopback plumbing itself is owned by the host networking
/// collaborator; inside tests and development this stand-in keeps the
/// registry honest without touching interfaces.
#[derive(Default)]
pub struct LoggingVif;

impl VifBackend for LoggingVif {
    fn add_alias(&self, virtual_address: &str, port: u16, protocol: Protocol) -> std::io::Result<()> {
        info!(virtual_address, port, %protocol, "registering loopback alias");
        Ok(())
    }
}

/// Tracks which virtual addresses have been registered on this host.
pub struct VifRegistry {
    backend: Box<dyn VifBackend>,
    registered: Mutex<HashSet<(String, u16, Protocol)>>,
}

impl VifRegistry {
    pub fn new(backend: Box<dyn VifBackend>) -> Self {
        Self {
            backend,
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// Register once per unique `(address, port, protocol)`.
    ///
    /// Returns true when this call performed the registration.
    pub fn register_virtual_address(
        &self,
        virtual_address: &str,
        port: u16,
        protocol: Protocol,
    ) -> std::io::Result<bool> {
        let key = (virtual_address.to_string(), port, protocol);
        {
            let mut registered = self.registered.lock().expect("vif registry lock");
            if !registered.insert(key) {
                debug!(virtual_address, port, "virtual address already registered");
                return Ok(false);
            }
        }
        self.backend.add_alias(virtual_address, port, protocol)?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.registered.lock().expect("vif registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VifRegistry {
    fn default() -> Self {
        Self::new(Box::new(LoggingVif))
    }
}
