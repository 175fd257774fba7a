//! JSON-over-TCP RPC between masters, agents, and CLI clients.
//!
//! Wire format: every message is a 4-byte big-endian length prefix
//! followed by one JSON-encoded [`Request`] or [`Response`]. Errors carry
//! the control plane's error kind so callers can apply the retry policy
//! without string matching.

mod client;
mod protocol;
mod server;

pub use client::ControlClient;
pub use protocol::{read_frame, write_frame, Request, Response, RpcFailure};
pub use server::RpcServer;

use harbor_model::ErrorKind;
use thiserror::Error;

/// Result type alias for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors raised on the RPC client side.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("dial timed out after {0:?}")]
    DialTimeout(std::time::Duration),
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Transport(_) | RpcError::DialTimeout(_) => ErrorKind::Transient,
            RpcError::Protocol(_) => ErrorKind::InvalidArgument,
            RpcError::Remote { kind, .. } => *kind,
        }
    }
}
