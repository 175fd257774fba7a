//! Error classification shared across the control plane.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad classification of a control-plane failure.
///
/// Every subsystem error maps to one of these kinds; the kind decides the
/// handling policy (retry, consume, surface, or terminate) and is what RPC
/// callers see on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The named entity does not exist.
    NotFound,
    /// The entity already exists where a fresh create was required.
    AlreadyExists,
    /// The caller supplied a malformed or out-of-range argument.
    InvalidArgument,
    /// A validation gate failed (vhost conflict, no IPs available, ...).
    PreconditionFailed,
    /// A retryable fault: watch session loss, dial timeout, storage not ready.
    Transient,
    /// Unrecoverable daemon-level failure.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::PreconditionFailed => "precondition failed",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Errors raised by model-level validation and tree walking.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("empty service id not allowed")]
    EmptyServiceId,

    #[error("invalid endpoint application pattern '{pattern}': {source}")]
    BadApplicationPattern {
        pattern: String,
        source: regex::Error,
    },
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::ServiceNotFound(_) => ErrorKind::NotFound,
            ModelError::EmptyServiceId => ErrorKind::InvalidArgument,
            ModelError::BadApplicationPattern { .. } => ErrorKind::InvalidArgument,
        }
    }
}
