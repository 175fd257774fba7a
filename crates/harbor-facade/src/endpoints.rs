//! Endpoint resolution: matching imports to live exporters.

use std::collections::HashMap;

use regex::Regex;
use tracing::{debug, warn};

use harbor_coord::{paths, CoordError};
use harbor_model::{ApplicationEndpoint, ServiceState};

use crate::facade::Facade;
use crate::FacadeResult;

impl Facade {
    /// Resolve the imported endpoints of a service against the live
    /// service states of its tenant subtree.
    ///
    /// Each import's `application` is matched as `^application$` against
    /// exporters; the import's own non-zero port and protocol override
    /// the export's. Results are keyed `"{protocol}:{containerPort}"`.
    pub fn get_service_endpoints(
        &self,
        service_id: &str,
    ) -> FacadeResult<HashMap<String, Vec<ApplicationEndpoint>>> {
        let mut result: HashMap<String, Vec<ApplicationEndpoint>> = HashMap::new();
        let svc = self.get_service(service_id)?;
        if svc.imports().next().is_none() {
            return Ok(result);
        }

        // All live states in this service's tenant subtree.
        let tenant = self.tenant_id(service_id)?;
        let subtree = self.walk_subtree(&tenant)?;
        let mut states: Vec<ServiceState> = Vec::new();
        for member in &subtree {
            states.extend(self.published_states(&member.pool_id, &member.id)?);
        }

        for import in svc.imports() {
            let pattern = match Regex::new(&format!("^{}$", import.application)) {
                Ok(pattern) => pattern,
                Err(err) => {
                    // Reported at validation time already; don't spam.
                    debug!(application = %import.application, error = %err, "bad application pattern");
                    continue;
                }
            };

            let mut matched = false;
            for state in &states {
                let Some((host_port, container_port, protocol)) =
                    state.host_endpoint_info(&pattern)
                else {
                    continue;
                };
                // Import-side overrides.
                let container_port = if import.port_number != 0 {
                    import.port_number
                } else {
                    container_port
                };
                let endpoint = ApplicationEndpoint {
                    service_id: state.service_id.clone(),
                    application: import.application.clone(),
                    container_port,
                    host_port,
                    host_ip: state.host_ip.clone(),
                    container_ip: state.private_ip.clone(),
                    protocol,
                    virtual_address: import.virtual_address.clone(),
                    instance_id: state.instance_id,
                };
                result.entry(endpoint.key()).or_default().push(endpoint);
                matched = true;
            }
            if !matched {
                debug!(service = %svc.name, application = %import.application, "unmatched import");
            }
        }
        Ok(result)
    }

    /// The service states published for one service in its pool.
    fn published_states(
        &self,
        pool_id: &str,
        service_id: &str,
    ) -> FacadeResult<Vec<ServiceState>> {
        let node = paths::service_node(pool_id, service_id);
        let client = self.connections().for_path(&node)?;
        let ids = match client.children(&node) {
            Ok(ids) => ids,
            Err(CoordError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut states = Vec::new();
        for id in ids {
            match client.get_json::<ServiceState>(&paths::service_state_node(pool_id, service_id, &id)) {
                Ok((state, _)) => states.push(state),
                Err(CoordError::NotFound(_)) => {}
                Err(err) => {
                    warn!(state = %id, error = %err, "unreadable service state");
                }
            }
        }
        Ok(states)
    }
}
