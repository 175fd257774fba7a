//! Service-tree traversal.
//!
//! The tree is represented with parent ids and index lookups, never owning
//! pointers. Callers supply resolution closures so both the catalog and the
//! coordination namespace can drive a walk.

use crate::error::ModelError;
use crate::service::Service;
use crate::ServiceId;

/// Resolve a single service by id.
pub trait GetService {
    fn get_service(&self, id: &str) -> Result<Service, ModelError>;
}

impl<F> GetService for F
where
    F: Fn(&str) -> Result<Service, ModelError>,
{
    fn get_service(&self, id: &str) -> Result<Service, ModelError> {
        self(id)
    }
}

/// Visit `id` and every descendant, depth-first, parents before children.
///
/// The visitor may return an error to abort the walk; `get_children`
/// resolves direct children by parent id.
pub fn walk<V, G, C, E>(id: &str, visit: &mut V, get_service: &G, get_children: &C) -> Result<(), E>
where
    V: FnMut(&Service) -> Result<(), E>,
    G: Fn(&str) -> Result<Service, E>,
    C: Fn(&str) -> Result<Vec<Service>, E>,
{
    let svc = get_service(id)?;
    visit(&svc)?;
    for child in get_children(id)? {
        walk(&child.id, visit, get_service, get_children)?;
    }
    Ok(())
}

/// Collect the ids of `id` and every descendant.
pub fn subtree_ids<G, C, E>(id: &str, get_service: &G, get_children: &C) -> Result<Vec<ServiceId>, E>
where
    G: Fn(&str) -> Result<Service, E>,
    C: Fn(&str) -> Result<Vec<Service>, E>,
{
    let mut ids = Vec::new();
    walk(
        id,
        &mut |svc: &Service| {
            ids.push(svc.id.clone());
            Ok(())
        },
        get_service,
        get_children,
    )?;
    Ok(ids)
}

/// Walk up `parent_id` links to the subtree root and return its id.
///
/// The fixed point holds: the tenant of a tenant is itself.
pub fn tenant_of<G: GetService>(id: &str, resolver: &G) -> Result<ServiceId, ModelError> {
    let mut svc = resolver.get_service(id)?;
    while !svc.parent_id.is_empty() {
        svc = resolver.get_service(&svc.parent_id)?;
    }
    Ok(svc.id)
}

/// Build the slash-separated name path from the tenant down to `id`.
pub fn service_path<G: GetService>(id: &str, resolver: &G) -> Result<String, ModelError> {
    let mut names = Vec::new();
    let mut svc = resolver.get_service(id)?;
    names.push(svc.name.clone());
    while !svc.parent_id.is_empty() {
        svc = resolver.get_service(&svc.parent_id)?;
        names.push(svc.name.clone());
    }
    names.reverse();
    Ok(format!("/{}", names.join("/")))
}
