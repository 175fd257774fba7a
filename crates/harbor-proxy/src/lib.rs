//! Client-side proxy routing.
//!
//! Inside each container, every imported endpoint gets a local `tcp4`
//! listener on its container port backed by a rotating set of remote
//! addresses. The router refreshes the address sets from the master every
//! ten seconds; new connections pick a remote round-robin, existing
//! connections are never disturbed.

mod local;
mod router;
mod vif;

pub use local::{Forward, LocalProxy};
pub use router::{EndpointSource, ProxyRouter};
pub use vif::{LoggingVif, VifBackend, VifRegistry};

use thiserror::Error;

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors raised by the proxy router.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("endpoint refresh failed: {0}")]
    Refresh(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls setup failed: {0}")]
    Tls(String),
}
