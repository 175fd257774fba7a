//! Scheduled instances: service states and per-host desired states.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::service::{DesiredState, Endpoint, Protocol, Purpose};
use crate::{HostId, ServiceId};

/// A host-side port binding for a container port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostIpAndPort {
    pub host_ip: String,
    pub host_port: u16,
}

/// One scheduled attempt at running a service instance.
///
/// Created by the scheduler, updated by the owning host agent, removed once
/// termination is final and the desired state is stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub id: String,
    pub service_id: ServiceId,
    pub host_id: HostId,
    /// Dense 0-based index within the service.
    pub instance_id: u32,
    /// Unix timestamp (seconds) of the last successful start; 0 if never.
    #[serde(default)]
    pub started: u64,
    /// Unix timestamp (seconds) of the last termination; 0 if never.
    #[serde(default)]
    pub terminated: u64,
    #[serde(default)]
    pub host_ip: String,
    /// Container-side address once the instance is up.
    #[serde(default)]
    pub private_ip: String,
    /// Runtime identifier of the launched container, if any.
    #[serde(default)]
    pub container_id: String,
    /// Container port -> host-side bindings.
    #[serde(default)]
    pub port_mappings: HashMap<String, Vec<HostIpAndPort>>,
    /// Endpoints with per-instance resolved values.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub exit_code: i32,
}

impl ServiceState {
    pub fn new(id: impl Into<String>, service_id: impl Into<ServiceId>, host_id: impl Into<HostId>, instance_id: u32) -> Self {
        Self {
            id: id.into(),
            service_id: service_id.into(),
            host_id: host_id.into(),
            instance_id,
            started: 0,
            terminated: 0,
            host_ip: String::new(),
            private_ip: String::new(),
            container_id: String::new(),
            port_mappings: HashMap::new(),
            endpoints: Vec::new(),
            exit_code: 0,
        }
    }

    /// Whether the instance is live from the agent's point of view: the
    /// last start postdates the last termination.
    pub fn is_running(&self) -> bool {
        self.started > self.terminated
    }

    /// Find the host-side port info for the first exported endpoint whose
    /// application matches `pattern`.
    ///
    /// Returns `(host_port, container_port, protocol)`.
    pub fn host_endpoint_info(&self, pattern: &Regex) -> Option<(u16, u16, Protocol)> {
        for ep in &self.endpoints {
            if ep.purpose != Purpose::Export || !pattern.is_match(&ep.application) {
                continue;
            }
            let container_port = ep.port_number;
            let host_port = self
                .port_mappings
                .get(&format!("{}/{}", container_port, ep.protocol))
                .and_then(|bindings| bindings.first())
                .map(|b| b.host_port)
                .unwrap_or(container_port);
            return Some((host_port, container_port, ep.protocol));
        }
        None
    }
}

/// The per-host record expressing the desired state of one instance.
///
/// Created by the scheduler alongside the matching [`ServiceState`];
/// watched by the host agent; deleted by the agent once the instance is
/// stopped and retired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    pub host_id: HostId,
    pub service_id: ServiceId,
    pub service_state_id: String,
    pub desired_state: DesiredState,
}

impl HostState {
    pub fn for_state(state: &ServiceState) -> Self {
        Self {
            host_id: state.host_id.clone(),
            service_id: state.service_id.clone(),
            service_state_id: state.id.clone(),
            desired_state: DesiredState::Run,
        }
    }

    /// Required fields an agent refuses to act without.
    pub fn is_complete(&self) -> bool {
        !self.service_id.is_empty() && !self.service_state_id.is_empty()
    }
}
