//! Local/remote client pair with path-prefix routing.

use tracing::warn;

use crate::client::Client;
use crate::{CoordError, CoordResult};

/// The daemon's coordination connections.
///
/// Operations route to the remote client when the path falls under one of
/// the registered remote prefixes; everything else uses the local client.
/// A missing remote is non-fatal: affected operations fail with
/// [`CoordError::Disconnected`] until it comes back.
#[derive(Clone)]
pub struct Connections {
    local: Client,
    remote: Option<Client>,
    remote_prefixes: Vec<String>,
}

impl Connections {
    /// A purely local namespace.
    pub fn local_only(local: Client) -> Self {
        Self {
            local,
            remote: None,
            remote_prefixes: Vec::new(),
        }
    }

    pub fn new(local: Client, remote: Option<Client>, remote_prefixes: Vec<String>) -> Self {
        if remote.is_none() && !remote_prefixes.is_empty() {
            warn!(
                prefixes = ?remote_prefixes,
                "remote coordination cluster unavailable, entering disconnected mode"
            );
        }
        Self {
            local,
            remote,
            remote_prefixes,
        }
    }

    /// The client responsible for `path`.
    pub fn for_path(&self, path: &str) -> CoordResult<&Client> {
        if self.remote_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return self.remote.as_ref().ok_or(CoordError::Disconnected);
        }
        Ok(&self.local)
    }

    /// The always-present local client.
    pub fn local(&self) -> &Client {
        &self.local
    }
}
