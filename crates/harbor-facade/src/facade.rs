//! Core facade operations: service CRUD and the start/stop/pause verbs.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use harbor_coord::Connections;
use harbor_model::{tree, DesiredState, Host, Launch, Pool, Service, User, SYSTEM_USER_NAME};
use harbor_state::{Catalog, TenantCache};
use harbor_template::Evaluator;

use crate::publish::{check_running_vhost, claim_vhosts, publish_service, release_vhosts, unpublish_service};
use crate::reconciler::{PublishOp, PublishReconciler};
use crate::{FacadeError, FacadeResult};

/// The control plane's mutation gateway.
///
/// Catalog writes come first; coordination publication follows and is
/// never allowed to roll a catalog write back. Failed publications are
/// queued for the background reconciler.
pub struct Facade {
    catalog: Catalog,
    conns: Connections,
    tenants: Arc<TenantCache>,
    publish_queue: mpsc::UnboundedSender<PublishOp>,
}

impl Facade {
    /// Build the facade and its publish reconciler (spawn the latter).
    pub fn new(catalog: Catalog, conns: Connections) -> (Self, PublishReconciler) {
        let (publish_queue, reconciler) = PublishReconciler::new(conns.clone());
        (
            Self {
                catalog,
                conns,
                tenants: Arc::new(TenantCache::new()),
                publish_queue,
            },
            reconciler,
        )
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn connections(&self) -> &Connections {
        &self.conns
    }

    // ── Service CRUD ───────────────────────────────────────────────

    /// Add a new service. Fails if the id is taken or the parent is
    /// unknown.
    pub fn add_service(&self, mut svc: Service) -> FacadeResult<()> {
        svc.id = svc.id.trim().to_string();
        if svc.id.is_empty() {
            return Err(FacadeError::InvalidArgument(
                "empty service id not allowed".to_string(),
            ));
        }
        if self.catalog.get_service(&svc.id)?.is_some() {
            return Err(FacadeError::AlreadyExists(svc.id));
        }
        if !svc.parent_id.is_empty() && self.catalog.get_service(&svc.parent_id)?.is_none() {
            return Err(FacadeError::InvalidArgument(format!(
                "parent service {} does not exist",
                svc.parent_id
            )));
        }

        self.evaluate_templates(&mut svc);

        if svc.config_files.is_empty() {
            self.catalog.put_service(&svc)?;
            self.publish(&svc);
            info!(service = %svc.id, "service added");
            return Ok(());
        }

        // Seed config files as first revisions through the update path.
        self.catalog.put_service(&svc)?;
        let mut seeded = svc;
        for conf in seeded.config_files.values_mut() {
            conf.commit = "initial revision".to_string();
        }
        self.update_service_internal(seeded)?;
        Ok(())
    }

    /// Update a service, with start-validation when the desired state is
    /// run.
    pub fn update_service(&self, svc: Service) -> FacadeResult<()> {
        if svc.desired_state == DesiredState::Run {
            self.validate_service_start(&svc)?;
            for ep in svc.vhost_endpoints() {
                for vhost in &ep.vhosts {
                    check_running_vhost(&self.conns, vhost, &svc.id)?;
                }
            }
        }
        self.update_service_internal(svc)
    }

    /// Remove a service and its whole subtree.
    ///
    /// Coordination nodes go first, then catalog rows, children before
    /// parents. Address assignments are removed only when
    /// `remove_assignments` is set; by default they are left in place so
    /// a re-added service keeps its addresses.
    pub fn remove_service(&self, id: &str, remove_assignments: bool) -> FacadeResult<()> {
        let services = self.walk_subtree(id)?;

        for svc in &services {
            if let Err(err) = unpublish_service(&self.conns, &svc.pool_id, &svc.id) {
                warn!(service = %svc.id, error = %err, "unpublish failed, queueing retry");
                let _ = self.publish_queue.send(PublishOp::Remove {
                    pool_id: svc.pool_id.clone(),
                    service_id: svc.id.clone(),
                });
            }
            release_vhosts(&self.conns, svc);
        }

        for svc in services.iter().rev() {
            self.catalog.delete_service(&svc.id)?;
            if remove_assignments {
                for assignment in self.catalog.assignments_for_service(&svc.id)? {
                    self.catalog
                        .delete_assignment(&assignment.service_id, &assignment.endpoint_name)?;
                }
            }
        }
        self.tenants.invalidate();
        info!(service = %id, count = services.len(), "service subtree removed");
        Ok(())
    }

    /// Fetch a service with assignments and compacted config files
    /// filled in.
    pub fn get_service(&self, id: &str) -> FacadeResult<Service> {
        let mut svc = self
            .catalog
            .get_service(id)?
            .ok_or_else(|| FacadeError::NotFound(format!("service {id}")))?;
        self.fill_service(&mut svc)?;
        Ok(svc)
    }

    /// All services, filled in.
    pub fn get_services(&self) -> FacadeResult<Vec<Service>> {
        let mut services = self.catalog.all_services()?;
        for svc in &mut services {
            self.fill_service(svc)?;
        }
        Ok(services)
    }

    /// Services carrying all of the given tags, filled in.
    pub fn get_tagged_services(&self, tags: &[String]) -> FacadeResult<Vec<Service>> {
        let mut services = self.catalog.query_services(tags)?;
        for svc in &mut services {
            self.fill_service(svc)?;
        }
        Ok(services)
    }

    /// The tenant (subtree root) of a service.
    pub fn tenant_id(&self, service_id: &str) -> FacadeResult<String> {
        Ok(self.tenants.tenant_of(&self.catalog, service_id)?)
    }

    // ── Start / stop / pause ───────────────────────────────────────

    /// Set the whole subtree running, after validating all of it.
    pub fn start_service(&self, id: &str) -> FacadeResult<()> {
        let services = self.walk_subtree(id)?;
        for svc in &services {
            self.validate_service_start(svc)?;
            for ep in svc.vhost_endpoints() {
                for vhost in &ep.vhosts {
                    check_running_vhost(&self.conns, vhost, &svc.id)?;
                }
            }
        }
        for mut svc in services {
            svc.desired_state = DesiredState::Run;
            self.update_service_internal(svc)?;
        }
        Ok(())
    }

    /// Stop the subtree; manually launched services are left alone.
    pub fn stop_service(&self, id: &str) -> FacadeResult<()> {
        for mut svc in self.walk_subtree(id)? {
            if svc.launch == Launch::Manual {
                continue;
            }
            svc.desired_state = DesiredState::Stop;
            self.update_service_internal(svc)?;
        }
        Ok(())
    }

    /// Pause the subtree.
    pub fn pause_service(&self, id: &str) -> FacadeResult<()> {
        for mut svc in self.walk_subtree(id)? {
            svc.desired_state = DesiredState::Pause;
            self.update_service_internal(svc)?;
        }
        Ok(())
    }

    // ── Hosts, pools, users ────────────────────────────────────────

    pub fn get_host(&self, id: &str) -> FacadeResult<Option<Host>> {
        Ok(self.catalog.get_host(id)?)
    }

    /// Register or refresh a host. Its pool must exist.
    pub fn update_host(&self, host: &Host) -> FacadeResult<()> {
        if self.catalog.get_pool(&host.pool_id)?.is_none() {
            return Err(FacadeError::InvalidArgument(format!(
                "pool {} does not exist",
                host.pool_id
            )));
        }
        Ok(self.catalog.put_host(host)?)
    }

    /// Create or update a pool and publish its virtual-IP ownership
    /// nodes.
    pub fn add_pool(&self, pool: &Pool) -> FacadeResult<()> {
        let previous = self.catalog.get_pool(&pool.id)?;
        self.catalog.put_pool(pool)?;

        let root = harbor_coord::paths::pool_root(&pool.id);
        let client = self.conns.for_path(&root)?;
        client.ensure_path(&format!("{root}/virtualips"))?;
        for vip in &pool.virtual_ips {
            let node = harbor_coord::paths::virtual_ip_node(&pool.id, &vip.ip);
            match client.create_json(&node, vip) {
                Ok(()) => {}
                Err(harbor_coord::CoordError::AlreadyExists(_)) => {
                    client.set_json(&node, vip, harbor_coord::ANY_VERSION)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        // Retire ownership nodes for IPs dropped from the pool.
        if let Some(previous) = previous {
            for vip in &previous.virtual_ips {
                if pool.virtual_ips.iter().any(|v| v.ip == vip.ip) {
                    continue;
                }
                let node = harbor_coord::paths::virtual_ip_node(&pool.id, &vip.ip);
                match client.delete(&node, harbor_coord::ANY_VERSION) {
                    Ok(()) | Err(harbor_coord::CoordError::NotFound(_)) => {}
                    Err(err) => warn!(ip = %vip.ip, error = %err, "could not retire virtual ip node"),
                }
            }
        }
        Ok(())
    }

    pub fn get_pool(&self, id: &str) -> FacadeResult<Option<Pool>> {
        Ok(self.catalog.get_pool(id)?)
    }

    pub fn validate_credentials(&self, name: &str, password: &str) -> FacadeResult<bool> {
        Ok(self.catalog.validate_credentials(name, password)?)
    }

    /// The built-in system account, created on first use.
    pub fn get_system_user(&self) -> FacadeResult<User> {
        if let Some(user) = self.catalog.get_user(SYSTEM_USER_NAME)? {
            return Ok(user);
        }
        let user = User {
            name: SYSTEM_USER_NAME.to_string(),
            password: uuid::Uuid::new_v4().to_string(),
        };
        self.catalog.put_user(&user)?;
        Ok(user)
    }

    // ── Internals ──────────────────────────────────────────────────

    /// The validated update path: config revision bookkeeping, catalog
    /// write, then publication.
    pub(crate) fn update_service_internal(&self, mut svc: Service) -> FacadeResult<()> {
        svc.id = svc.id.trim().to_string();
        if svc.id.is_empty() {
            return Err(FacadeError::InvalidArgument(
                "empty service id not allowed".to_string(),
            ));
        }

        let old = self
            .catalog
            .get_service(&svc.id)?
            .ok_or_else(|| FacadeError::NotFound(format!("service {}", svc.id)))?;

        if old.parent_id != svc.parent_id {
            self.ensure_no_cycle(&svc)?;
            self.tenants.invalidate();
        }

        self.evaluate_templates(&mut svc);
        // Publication must carry current assignments.
        self.fill_assignments(&mut svc)?;
        self.record_config_revisions(&old, &svc)?;

        self.catalog.put_service(&svc)?;

        if old.pool_id != svc.pool_id {
            if let Err(err) = unpublish_service(&self.conns, &old.pool_id, &svc.id) {
                warn!(service = %svc.id, error = %err, "unpublish from old pool failed, queueing retry");
                let _ = self.publish_queue.send(PublishOp::Remove {
                    pool_id: old.pool_id.clone(),
                    service_id: svc.id.clone(),
                });
            }
        }
        self.publish(&svc);

        if svc.desired_state == DesiredState::Run {
            claim_vhosts(&self.conns, &svc)?;
        } else {
            release_vhosts(&self.conns, &svc);
        }
        debug!(service = %svc.id, desired = ?svc.desired_state, "service updated");
        Ok(())
    }

    /// Publish now, or queue for the reconciler. Never fails the caller.
    fn publish(&self, svc: &Service) {
        if let Err(err) = publish_service(&self.conns, svc) {
            warn!(service = %svc.id, error = %err, "publish failed, queueing retry");
            let _ = self
                .publish_queue
                .send(PublishOp::Update(Box::new(svc.clone())));
        }
    }

    /// Every endpoint that requires an address must have one.
    pub(crate) fn validate_service_start(&self, svc: &Service) -> FacadeResult<()> {
        for ep in &svc.endpoints {
            if ep.needs_assignment()
                && self.catalog.get_assignment(&svc.id, &ep.name)?.is_none()
            {
                return Err(FacadeError::Precondition(format!(
                    "service {} endpoint {} needs an address assignment",
                    svc.id, ep.name
                )));
            }
        }
        Ok(())
    }

    /// Write-time template pass with the catalog as resolver.
    pub(crate) fn evaluate_templates(&self, svc: &mut Service) {
        let catalog = self.catalog.clone();
        let evaluator =
            Evaluator::new(move |id: &str| catalog.get_service(id).ok().flatten());
        evaluator.evaluate_service(svc);
    }

    /// Attach stored assignments to the service's endpoints.
    pub(crate) fn fill_assignments(&self, svc: &mut Service) -> FacadeResult<()> {
        let assignments = self.catalog.assignments_for_service(&svc.id)?;
        for ep in &mut svc.endpoints {
            ep.address_assignment = assignments
                .iter()
                .find(|a| a.endpoint_name == ep.name)
                .cloned();
        }
        Ok(())
    }

    fn fill_service(&self, svc: &mut Service) -> FacadeResult<()> {
        self.fill_assignments(svc)?;
        let tenant = self.tenants.tenant_of(&self.catalog, &svc.id)?;
        let path = self.service_path(&svc.id)?;
        for (name, conf) in self.catalog.latest_config_files(&tenant, &path)? {
            svc.config_files.insert(name, conf);
        }
        Ok(())
    }

    /// Diff config files against the stored service and write revisions:
    /// changed or new files get a fresh revision, removed files get a
    /// tombstone.
    fn record_config_revisions(&self, old: &Service, svc: &Service) -> FacadeResult<()> {
        if old.config_files == svc.config_files {
            return Ok(());
        }
        let tenant = self.tenants.tenant_of(&self.catalog, &svc.id)?;
        let path = self.service_path(&svc.id)?;
        let now = epoch_secs();

        let mut removed = old.config_files.clone();
        for (name, conf) in &svc.config_files {
            if let Some(old_conf) = removed.remove(name) {
                if old_conf.content == conf.content
                    && old_conf.commit == conf.commit
                    && old_conf.deleted == conf.deleted
                {
                    continue;
                }
            }
            let mut revision = conf.clone();
            revision.updated = now;
            revision.deleted = false;
            self.catalog
                .put_config_revision(&tenant, &path, &revision)?;
        }
        for (_, conf) in removed {
            let mut tombstone = conf;
            tombstone.content.clear();
            tombstone.deleted = true;
            tombstone.updated = now;
            self.catalog
                .put_config_revision(&tenant, &path, &tombstone)?;
        }
        Ok(())
    }

    /// The subtree rooted at `id`, parents before children.
    pub(crate) fn walk_subtree(&self, id: &str) -> FacadeResult<Vec<Service>> {
        let catalog = self.catalog.clone();
        let get = move |id: &str| -> FacadeResult<Service> {
            catalog
                .get_service(id)?
                .ok_or_else(|| FacadeError::NotFound(format!("service {id}")))
        };
        let catalog = self.catalog.clone();
        let children =
            move |parent: &str| -> FacadeResult<Vec<Service>> { Ok(catalog.child_services(parent)?) };

        let mut services = Vec::new();
        tree::walk(
            id,
            &mut |svc: &Service| {
                services.push(svc.clone());
                Ok(())
            },
            &get,
            &children,
        )?;
        Ok(services)
    }

    /// Name path from the tenant down, for config-revision keys.
    pub(crate) fn service_path(&self, id: &str) -> FacadeResult<String> {
        let catalog = self.catalog.clone();
        tree::service_path(id, &move |sid: &str| {
            catalog
                .get_service(sid)
                .map_err(|_| harbor_model::ModelError::ServiceNotFound(sid.to_string()))?
                .ok_or_else(|| harbor_model::ModelError::ServiceNotFound(sid.to_string()))
        })
        .map_err(|err| FacadeError::NotFound(err.to_string()))
    }

    /// Re-parenting may not introduce a cycle: the new ancestor chain
    /// must not pass through the service itself.
    fn ensure_no_cycle(&self, svc: &Service) -> FacadeResult<()> {
        let mut cursor = svc.parent_id.clone();
        while !cursor.is_empty() {
            if cursor == svc.id {
                return Err(FacadeError::InvalidArgument(format!(
                    "service {} cannot be its own ancestor",
                    svc.id
                )));
            }
            cursor = match self.catalog.get_service(&cursor)? {
                Some(parent) => parent.parent_id,
                None => {
                    return Err(FacadeError::InvalidArgument(format!(
                        "parent service {cursor} does not exist"
                    )))
                }
            };
        }
        Ok(())
    }
}

pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl From<harbor_model::ModelError> for FacadeError {
    fn from(err: harbor_model::ModelError) -> Self {
        match err.kind() {
            harbor_model::ErrorKind::NotFound => FacadeError::NotFound(err.to_string()),
            _ => FacadeError::InvalidArgument(err.to_string()),
        }
    }
}
