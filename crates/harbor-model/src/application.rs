//! Resolved application endpoints and mux source metadata.

use serde::{Deserialize, Serialize};

use crate::service::Protocol;
use crate::ServiceId;

/// One resolved remote endpoint an importing instance can reach.
///
/// Produced by endpoint resolution on the master: an import endpoint
/// matched against a live exporter's service state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationEndpoint {
    pub service_id: ServiceId,
    pub application: String,
    pub container_port: u16,
    pub host_port: u16,
    pub host_ip: String,
    #[serde(default)]
    pub container_ip: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub virtual_address: String,
    pub instance_id: u32,
}

impl ApplicationEndpoint {
    /// Map key grouping endpoints by local listener.
    pub fn key(&self) -> String {
        format!("{}:{}", self.protocol, self.container_port)
    }

    /// Remote address the proxy dials (through the exporter host's mux).
    pub fn host_addr(&self) -> String {
        format!("{}:{}", self.host_ip, self.host_port)
    }
}

/// Who is on the near side of a mux connection.
///
/// Carried as an optional JSON field in the mux header for connection
/// accounting on the receiving agent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MuxSource {
    #[serde(default)]
    pub agent_host_ip: String,
    #[serde(default)]
    pub agent_host_id: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub container_ip: String,
    #[serde(default)]
    pub container_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_combines_protocol_and_container_port() {
        let ep = ApplicationEndpoint {
            service_id: "svc".to_string(),
            application: "postgres".to_string(),
            container_port: 5432,
            host_port: 32768,
            host_ip: "10.0.0.1".to_string(),
            container_ip: String::new(),
            protocol: Protocol::Tcp,
            virtual_address: String::new(),
            instance_id: 0,
        };
        assert_eq!(ep.key(), "tcp:5432");
        assert_eq!(ep.host_addr(), "10.0.0.1:32768");
    }
}
