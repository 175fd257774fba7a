//! Mux header line parsing and encoding.

use harbor_model::{ApplicationEndpoint, MuxSource};
use tracing::warn;

use crate::{MuxError, MuxResult};

/// The escape for `:` inside JSON header fields, which would otherwise
/// collide with the field separator.
const COLON_ESCAPE: &str = "===";

/// A parsed mux header line.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxHeader {
    /// Backend host from the second-to-last field.
    pub dst_host: String,
    /// Backend port from the last field.
    pub dst_port: u16,
    /// The first field, conventionally a human-readable destination name.
    pub dst_name: String,
    /// Optional source metadata from field position 1.
    pub source: Option<MuxSource>,
    /// Optional endpoint metadata from field position 2.
    pub endpoint: Option<ApplicationEndpoint>,
}

impl MuxHeader {
    /// Minimal header naming only the backend.
    pub fn to_backend(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            dst_name: host.clone(),
            dst_host: host,
            dst_port: port,
            source: None,
            endpoint: None,
        }
    }

    /// Parse one header line (without the trailing newline).
    ///
    /// The line must have at least two colon-separated fields; the last
    /// two are the backend address. Metadata fields that fail to decode
    /// are logged and dropped, never fatal.
    pub fn parse(line: &str) -> MuxResult<Self> {
        let line = line.trim();
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 2 {
            return Err(MuxError::Header(line.to_string()));
        }

        let dst_host = parts[parts.len() - 2].to_string();
        let dst_port: u16 = parts[parts.len() - 1]
            .parse()
            .map_err(|_| MuxError::Header(line.to_string()))?;

        let source = (parts.len() > 2).then(|| unescape_json::<MuxSource>(parts[1])).flatten();
        let endpoint = (parts.len() > 3)
            .then(|| unescape_json::<ApplicationEndpoint>(parts[2]))
            .flatten();

        Ok(Self {
            dst_host,
            dst_port,
            dst_name: parts[0].to_string(),
            source,
            endpoint,
        })
    }

    /// Encode as a wire line, including the trailing newline.
    pub fn encode(&self) -> String {
        match (&self.source, &self.endpoint) {
            (None, None) => format!("{}:{}\n", self.dst_host, self.dst_port),
            (source, endpoint) => {
                let src = source
                    .as_ref()
                    .map(escape_json)
                    .unwrap_or_default();
                let ep = endpoint
                    .as_ref()
                    .map(escape_json)
                    .unwrap_or_default();
                format!(
                    "{}:{}:{}:{}:{}\n",
                    self.dst_name, src, ep, self.dst_host, self.dst_port
                )
            }
        }
    }
}

fn unescape_json<T: serde::de::DeserializeOwned>(field: &str) -> Option<T> {
    if field.is_empty() {
        return None;
    }
    let raw = field.replace(COLON_ESCAPE, ":");
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(field, error = %err, "could not decode mux header metadata");
            None
        }
    }
}

fn escape_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .map(|s| s.replace(':', COLON_ESCAPE))
        .unwrap_or_default()
}
