//! The per-host agent.
//!
//! One agent runs on every host. It discovers its pool from the master,
//! registers the host and an ephemeral presence marker in the coordination
//! namespace, waits for the storage leader, and then realizes desired
//! state: every host-state child spawns an instance loop that starts,
//! reattaches, or stops a container and keeps the published service state
//! current.

mod agent;
mod instance;
mod master;
mod runtime;

pub use agent::{AgentConfig, HostAgent};
pub use master::MasterClient;
pub use runtime::{ContainerRuntime, InstanceHandle, MockRuntime};

use harbor_coord::CoordError;
use harbor_model::ErrorKind;
use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors raised by the host agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error("master rpc failed: {0}")]
    Master(String),

    #[error("container runtime failed: {0}")]
    Runtime(String),

    #[error("host {0} is not registered with the master")]
    UnknownHost(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Coord(err) => err.kind(),
            AgentError::Master(_) => ErrorKind::Transient,
            AgentError::Runtime(_) => ErrorKind::Transient,
            AgentError::UnknownHost(_) => ErrorKind::NotFound,
        }
    }
}

pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
