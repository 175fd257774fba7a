//! Single-port TCP multiplexer.
//!
//! Every inbound connection starts with one line naming its destination:
//!
//! ```text
//! <field>:<field>:…:<dstHost>:<dstPort>\n
//! ```
//!
//! The last two colon-separated fields are the backend host and port;
//! optional earlier fields carry JSON metadata (with `:` escaped as `===`)
//! used for connection accounting. The mux dials the backend, forwards any
//! bytes buffered past the newline, and then proxies both directions until
//! either side closes. A TLS variant terminates TLS on the listener with a
//! supplied certificate chain, falling back to a built-in insecure
//! development identity.

mod header;
mod mux;
mod registry;
mod tls;

pub use header::MuxHeader;
pub use mux::{MuxConfig, TcpMux};
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use tls::{TlsIdentity, TlsMux};

use thiserror::Error;

/// Result type alias for mux operations.
pub type MuxResult<T> = Result<T, MuxError>;

/// Errors raised by the mux.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("malformed mux header line: {0}")]
    Header(String),

    #[error("header read timed out")]
    HeaderTimeout,

    #[error("could not dial backend {addr}: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls setup failed: {0}")]
    Tls(String),
}
