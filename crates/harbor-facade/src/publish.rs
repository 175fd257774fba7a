//! Coordination-namespace publication and vhost claims.

use harbor_coord::{paths, Connections, CoordError, CoordResult, ANY_VERSION};
use harbor_model::{DesiredState, Service};
use tracing::{debug, warn};

use crate::{FacadeError, FacadeResult};

/// Write (or rewrite) a service definition node under its pool, leaving
/// any state children untouched.
pub(crate) fn publish_service(conns: &Connections, svc: &Service) -> CoordResult<()> {
    let node = paths::service_node(&svc.pool_id, &svc.id);
    let client = conns.for_path(&node)?;
    client.ensure_path(&paths::services_dir(&svc.pool_id))?;
    match client.create_json(&node, svc) {
        Ok(()) => {}
        Err(CoordError::AlreadyExists(_)) => {
            client.set_json(&node, svc, ANY_VERSION)?;
        }
        Err(err) => return Err(err),
    }
    debug!(service = %svc.id, pool = %svc.pool_id, "service published");
    Ok(())
}

/// Remove a service definition (and its state children) from a pool.
pub(crate) fn unpublish_service(
    conns: &Connections,
    pool_id: &str,
    service_id: &str,
) -> CoordResult<()> {
    let node = paths::service_node(pool_id, service_id);
    let client = conns.for_path(&node)?;
    match client.delete_recursive(&node) {
        Ok(()) | Err(CoordError::NotFound(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Reject starting a service whose vhost is already claimed elsewhere.
///
/// Zero live claims is fine; a claim by the same service is idempotent;
/// anything else fails the precondition.
pub fn check_running_vhost(
    conns: &Connections,
    vhost: &str,
    service_id: &str,
) -> FacadeResult<()> {
    let dir = paths::vhost_dir(vhost);
    let client = conns.for_path(&dir)?;
    let claims = match client.children(&dir) {
        Ok(claims) => claims,
        Err(CoordError::NotFound(_)) => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    match claims.len() {
        0 => Ok(()),
        1 => {
            let (owner, _) = client.get(&paths::vhost_claim(vhost, &claims[0]))?;
            if owner == service_id.as_bytes() {
                Ok(())
            } else {
                Err(FacadeError::Precondition(format!(
                    "vhost {vhost} is already running under a different service"
                )))
            }
        }
        n => Err(FacadeError::Precondition(format!(
            "vhost {vhost} has {n} live claims"
        ))),
    }
}

/// Claim every vhost of a running service with ephemeral nodes.
pub(crate) fn claim_vhosts(conns: &Connections, svc: &Service) -> FacadeResult<()> {
    if svc.desired_state != DesiredState::Run {
        return Ok(());
    }
    for ep in svc.vhost_endpoints() {
        for vhost in &ep.vhosts {
            let dir = paths::vhost_dir(vhost);
            let client = conns.for_path(&dir)?;
            client.ensure_path(&dir)?;
            // The claim is named by the claiming service, making a repeat
            // claim by the same service idempotent.
            match client.create_ephemeral(&paths::vhost_claim(vhost, &svc.id), svc.id.as_bytes()) {
                Ok(()) | Err(CoordError::AlreadyExists(_)) => {}
                Err(err) => return Err(err.into()),
            }
            debug!(vhost = %vhost, service = %svc.id, "vhost claimed");
        }
    }
    Ok(())
}

/// Drop this service's vhost claims.
pub(crate) fn release_vhosts(conns: &Connections, svc: &Service) {
    for ep in svc.vhost_endpoints() {
        for vhost in &ep.vhosts {
            let claim = paths::vhost_claim(vhost, &svc.id);
            let Ok(client) = conns.for_path(&claim) else {
                continue;
            };
            match client.delete(&claim, ANY_VERSION) {
                Ok(()) | Err(CoordError::NotFound(_)) => {}
                Err(err) => warn!(vhost = %vhost, error = %err, "could not release vhost claim"),
            }
        }
    }
}
