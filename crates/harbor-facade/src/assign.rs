//! IP assignment for endpoints that require a stable address.

use rand::Rng;
use tracing::info;

use harbor_model::{AddressAssignment, AssignmentRequest, AssignmentType};

use crate::facade::Facade;
use crate::{FacadeError, FacadeResult};

/// One address available for assignment in a pool.
#[derive(Debug, Clone)]
struct PoolAddress {
    ip: String,
    kind: AssignmentType,
    host_id: String,
}

impl Facade {
    /// Assign an IP to every endpoint in the subtree that requires one.
    ///
    /// Automatic assignment picks uniformly at random from the pool's IP
    /// union (host static IPs plus pool virtual IPs); manual assignment
    /// verifies membership. Existing assignments are replaced, and each
    /// touched service is re-published so the coordination namespace
    /// carries the new addresses.
    pub fn assign_ips(&self, request: &AssignmentRequest) -> FacadeResult<()> {
        let root = self.get_service(&request.service_id)?;
        let addresses = self.pool_addresses(&root.pool_id)?;
        if addresses.is_empty() {
            return Err(FacadeError::Precondition(format!(
                "no IPs available in pool {}",
                root.pool_id
            )));
        }

        let chosen = if request.auto_assignment {
            let idx = rand::thread_rng().gen_range(0..addresses.len());
            addresses[idx].clone()
        } else {
            addresses
                .iter()
                .find(|a| a.ip == request.ip_address)
                .cloned()
                .ok_or_else(|| {
                    FacadeError::Precondition(format!(
                        "requested IP address {} is not contained in pool {}",
                        request.ip_address, root.pool_id
                    ))
                })?
        };
        info!(
            service = %request.service_id,
            ip = %chosen.ip,
            kind = ?chosen.kind,
            "assigning addresses"
        );

        for mut svc in self.walk_subtree(&request.service_id)? {
            let mut touched = false;
            for ep in svc.endpoints.clone() {
                let Some(config) = ep.address_config.as_ref() else {
                    continue;
                };
                // One assignment per endpoint: drop any previous one.
                self.catalog().delete_assignment(&svc.id, &ep.name)?;
                let assignment = AddressAssignment {
                    id: uuid::Uuid::new_v4().to_string(),
                    service_id: svc.id.clone(),
                    endpoint_name: ep.name.clone(),
                    ip: chosen.ip.clone(),
                    port: config.port,
                    assignment_type: chosen.kind,
                    host_id: chosen.host_id.clone(),
                    pool_id: svc.pool_id.clone(),
                };
                self.catalog().put_assignment(&assignment)?;
                touched = true;
            }
            if touched {
                // Re-publish with the fresh assignments attached.
                self.update_service_internal(svc)?;
            }
        }
        Ok(())
    }

    /// The pool's assignable address union.
    fn pool_addresses(&self, pool_id: &str) -> FacadeResult<Vec<PoolAddress>> {
        let mut addresses = Vec::new();
        for host in self.catalog().hosts_in_pool(pool_id)? {
            for ip in &host.static_ips {
                addresses.push(PoolAddress {
                    ip: ip.clone(),
                    kind: AssignmentType::Static,
                    host_id: host.id.clone(),
                });
            }
        }
        if let Some(pool) = self.catalog().get_pool(pool_id)? {
            for vip in &pool.virtual_ips {
                addresses.push(PoolAddress {
                    ip: vip.ip.clone(),
                    kind: AssignmentType::Virtual,
                    host_id: String::new(),
                });
            }
        }
        Ok(addresses)
    }
}
