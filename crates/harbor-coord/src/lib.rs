//! Hierarchical coordination namespace.
//!
//! A thin ordered-path store: every node holds an opaque byte payload and a
//! monotonically increasing version. Consumers create nodes (optionally
//! ephemeral, bound to a session), read and CAS-write them, and arm one-shot
//! watches on single nodes or on child lists. Session expiry removes the
//! session's ephemerals and invalidates its watches with a distinguished
//! [`WatchEvent::Expired`].
//!
//! The store itself runs in-process ([`Coordinator`]); clients are cheap
//! session handles. A daemon holds a required local client and an optional
//! remote one, selected per path prefix by [`Connections`]; losing the
//! remote is non-fatal (disconnected mode).

mod backoff;
mod client;
mod conns;
mod election;
pub mod paths;

pub use backoff::Backoff;
pub use client::{Client, Coordinator, WatchEvent, WatchRx, ANY_VERSION};
pub use conns::Connections;
pub use election::{is_leadership_lost, LeaderElection};

use harbor_model::ErrorKind;
use thiserror::Error;

/// Result type alias for coordination operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors raised by the coordination client.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("node already exists: {0}")]
    AlreadyExists(String),

    #[error("parent missing for: {0}")]
    NoParent(String),

    #[error("version mismatch on {path}: expected {expected}, found {found}")]
    BadVersion {
        path: String,
        expected: u64,
        found: u64,
    },

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("session expired")]
    SessionExpired,

    #[error("remote coordination cluster unavailable (disconnected mode)")]
    Disconnected,

    #[error("payload decode failed at {path}: {source}")]
    Decode {
        path: String,
        source: serde_json::Error,
    },

    #[error("payload encode failed: {0}")]
    Encode(serde_json::Error),
}

impl CoordError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordError::NotFound(_) | CoordError::NoParent(_) => ErrorKind::NotFound,
            CoordError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            CoordError::BadVersion { .. } | CoordError::NotEmpty(_) => {
                ErrorKind::PreconditionFailed
            }
            CoordError::SessionExpired | CoordError::Disconnected => ErrorKind::Transient,
            CoordError::Decode { .. } | CoordError::Encode(_) => ErrorKind::InvalidArgument,
        }
    }
}
