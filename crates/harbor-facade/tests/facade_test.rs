//! Facade behavior across the catalog and the coordination namespace.

use harbor_coord::{paths, Client, Connections, Coordinator};
use harbor_facade::{Facade, FacadeError};
use harbor_model::{
    AddressConfig, AssignmentRequest, ConfigFile, DesiredState, Endpoint, Host, HostIpAndPort,
    Launch, Pool, Protocol, Service, ServiceState, VirtualIp,
};
use harbor_state::Catalog;

const POOL: &str = "default";

struct Rig {
    facade: Facade,
    client: Client,
}

fn rig() -> Rig {
    let coord = Coordinator::new();
    let client = coord.connect();
    let catalog = Catalog::open_in_memory().unwrap();
    catalog.put_pool(&Pool::new(POOL)).unwrap();
    let (facade, _reconciler) = Facade::new(catalog, Connections::local_only(coord.connect()));
    Rig { facade, client }
}

fn service(id: &str, parent: &str) -> Service {
    let mut svc = Service::new(id, POOL, id);
    svc.parent_id = parent.to_string();
    svc
}

fn config(filename: &str, content: &str) -> ConfigFile {
    ConfigFile {
        filename: filename.to_string(),
        content: content.to_string(),
        updated: 0,
        deleted: false,
        commit: String::new(),
    }
}

// ── CRUD ───────────────────────────────────────────────────────────

#[test]
fn add_then_get_roundtrips() {
    let rig = rig();
    let mut svc = service("svc", "");
    svc.startup = "run-app --workers 4".to_string();
    svc.instances = 2;
    rig.facade.add_service(svc.clone()).unwrap();

    let fetched = rig.facade.get_service("svc").unwrap();
    assert_eq!(fetched.id, svc.id);
    assert_eq!(fetched.startup, svc.startup);
    assert_eq!(fetched.instances, svc.instances);

    // And the definition is published into the pool namespace.
    assert!(rig.client.exists(&paths::service_node(POOL, "svc")).unwrap());
}

#[test]
fn duplicate_add_is_rejected() {
    let rig = rig();
    rig.facade.add_service(service("svc", "")).unwrap();
    let err = rig.facade.add_service(service("svc", "")).unwrap_err();
    assert!(matches!(err, FacadeError::AlreadyExists(_)));
}

#[test]
fn empty_id_is_invalid() {
    let rig = rig();
    let err = rig.facade.add_service(service("   ", "")).unwrap_err();
    assert!(matches!(err, FacadeError::InvalidArgument(_)));
}

#[test]
fn unknown_parent_is_rejected() {
    let rig = rig();
    let err = rig.facade.add_service(service("kid", "ghost")).unwrap_err();
    assert!(matches!(err, FacadeError::InvalidArgument(_)));
}

#[test]
fn add_with_configs_seeds_initial_revisions() {
    let rig = rig();
    let mut svc = service("svc", "");
    svc.config_files
        .insert("app.conf".to_string(), config("app.conf", "threads=4"));
    rig.facade.add_service(svc).unwrap();

    let fetched = rig.facade.get_service("svc").unwrap();
    let conf = &fetched.config_files["app.conf"];
    assert_eq!(conf.content, "threads=4");
    assert_eq!(conf.commit, "initial revision");
    assert!(conf.updated > 0);
}

#[test]
fn config_updates_compact_to_newest_non_deleted() {
    let rig = rig();
    let mut svc = service("svc", "");
    svc.config_files
        .insert("a.conf".to_string(), config("a.conf", "v1"));
    svc.config_files
        .insert("b.conf".to_string(), config("b.conf", "b1"));
    rig.facade.add_service(svc).unwrap();

    // Change a.conf, drop b.conf.
    let mut updated = rig.facade.get_service("svc").unwrap();
    updated
        .config_files
        .get_mut("a.conf")
        .unwrap()
        .content = "v2".to_string();
    updated.config_files.remove("b.conf");
    rig.facade.update_service(updated).unwrap();

    let fetched = rig.facade.get_service("svc").unwrap();
    assert_eq!(fetched.config_files["a.conf"].content, "v2");
    assert!(
        !fetched.config_files.contains_key("b.conf"),
        "tombstoned file must not reappear"
    );
}

#[test]
fn remove_service_clears_subtree_catalog_and_namespace() {
    let rig = rig();
    rig.facade.add_service(service("t", "")).unwrap();
    rig.facade.add_service(service("kid", "t")).unwrap();

    rig.facade.remove_service("t", false).unwrap();

    assert!(matches!(
        rig.facade.get_service("t"),
        Err(FacadeError::NotFound(_))
    ));
    assert!(matches!(
        rig.facade.get_service("kid"),
        Err(FacadeError::NotFound(_))
    ));
    assert!(!rig.client.exists(&paths::service_node(POOL, "t")).unwrap());
    assert!(!rig.client.exists(&paths::service_node(POOL, "kid")).unwrap());
}

#[test]
fn remove_service_keeps_assignments_unless_asked() {
    let rig = rig();
    seed_pool_ips(&rig);
    let mut svc = service("svc", "");
    svc.endpoints.push(addressed_endpoint());
    rig.facade.add_service(svc).unwrap();
    rig.facade
        .assign_ips(&AssignmentRequest {
            service_id: "svc".to_string(),
            ip_address: String::new(),
            auto_assignment: true,
        })
        .unwrap();
    assert!(rig
        .facade
        .catalog()
        .get_assignment("svc", "pg")
        .unwrap()
        .is_some());

    // Default path leaves the assignment behind.
    rig.facade.remove_service("svc", false).unwrap();
    assert!(rig
        .facade
        .catalog()
        .get_assignment("svc", "pg")
        .unwrap()
        .is_some());

    // Re-add and remove with the flag: assignment goes too.
    let mut svc = service("svc", "");
    svc.endpoints.push(addressed_endpoint());
    rig.facade.add_service(svc).unwrap();
    rig.facade.remove_service("svc", true).unwrap();
    assert!(rig
        .facade
        .catalog()
        .get_assignment("svc", "pg")
        .unwrap()
        .is_none());
}

// ── Desired-state verbs ────────────────────────────────────────────

#[test]
fn start_requires_address_assignments() {
    let rig = rig();
    let mut svc = service("svc", "");
    svc.endpoints.push(addressed_endpoint());
    rig.facade.add_service(svc).unwrap();

    let err = rig.facade.start_service("svc").unwrap_err();
    assert!(matches!(err, FacadeError::Precondition(_)));

    // The service stays stopped.
    let fetched = rig.facade.get_service("svc").unwrap();
    assert_eq!(fetched.desired_state, DesiredState::Stop);
}

#[test]
fn stop_skips_manually_launched_services() {
    let rig = rig();
    let mut auto = service("t", "");
    auto.desired_state = DesiredState::Run;
    rig.facade.add_service(auto).unwrap();
    let mut manual = service("tool", "t");
    manual.launch = Launch::Manual;
    manual.desired_state = DesiredState::Run;
    rig.facade.add_service(manual).unwrap();

    rig.facade.stop_service("t").unwrap();

    assert_eq!(
        rig.facade.get_service("t").unwrap().desired_state,
        DesiredState::Stop
    );
    assert_eq!(
        rig.facade.get_service("tool").unwrap().desired_state,
        DesiredState::Run,
        "manual services are not auto-stopped"
    );
}

#[test]
fn pause_propagates_to_the_subtree() {
    let rig = rig();
    rig.facade.add_service(service("t", "")).unwrap();
    rig.facade.add_service(service("kid", "t")).unwrap();

    rig.facade.pause_service("t").unwrap();
    assert_eq!(
        rig.facade.get_service("kid").unwrap().desired_state,
        DesiredState::Pause
    );
}

// ── VHosts ─────────────────────────────────────────────────────────

fn vhost_service(id: &str, vhost: &str) -> Service {
    let mut svc = service(id, "");
    let mut ep = Endpoint::export("web", "http", 8080);
    ep.vhosts.push(vhost.to_string());
    svc.endpoints.push(ep);
    svc
}

#[test]
fn second_vhost_claim_is_rejected() {
    let rig = rig();
    rig.facade
        .add_service(vhost_service("a", "web.example"))
        .unwrap();
    rig.facade
        .add_service(vhost_service("b", "web.example"))
        .unwrap();

    let mut a = rig.facade.get_service("a").unwrap();
    a.desired_state = DesiredState::Run;
    rig.facade.update_service(a).unwrap();

    let mut b = rig.facade.get_service("b").unwrap();
    b.desired_state = DesiredState::Run;
    let err = rig.facade.update_service(b).unwrap_err();
    assert!(matches!(err, FacadeError::Precondition(_)));

    // b stays stopped.
    assert_eq!(
        rig.facade.get_service("b").unwrap().desired_state,
        DesiredState::Stop
    );
}

#[test]
fn same_service_vhost_claim_is_idempotent() {
    let rig = rig();
    rig.facade
        .add_service(vhost_service("a", "web.example"))
        .unwrap();

    let mut a = rig.facade.get_service("a").unwrap();
    a.desired_state = DesiredState::Run;
    rig.facade.update_service(a.clone()).unwrap();
    // Updating the running service again must not conflict with its own
    // claim.
    rig.facade.update_service(a).unwrap();
}

#[test]
fn stopping_releases_the_vhost_claim() {
    let rig = rig();
    rig.facade
        .add_service(vhost_service("a", "web.example"))
        .unwrap();
    rig.facade
        .add_service(vhost_service("b", "web.example"))
        .unwrap();

    let mut a = rig.facade.get_service("a").unwrap();
    a.desired_state = DesiredState::Run;
    rig.facade.update_service(a).unwrap();

    let mut a = rig.facade.get_service("a").unwrap();
    a.desired_state = DesiredState::Stop;
    rig.facade.update_service(a).unwrap();

    // Now b can claim it.
    let mut b = rig.facade.get_service("b").unwrap();
    b.desired_state = DesiredState::Run;
    rig.facade.update_service(b).unwrap();
}

// ── IP assignment ──────────────────────────────────────────────────

fn addressed_endpoint() -> Endpoint {
    let mut ep = Endpoint::export("pg", "postgres", 5432);
    ep.address_config = Some(AddressConfig {
        port: 5432,
        protocol: Protocol::Tcp,
    });
    ep
}

fn seed_pool_ips(rig: &Rig) {
    let mut host = Host::new("h1", POOL, "10.0.0.1");
    host.static_ips = vec!["10.0.0.1".to_string()];
    rig.facade.update_host(&host).unwrap();

    let mut pool = Pool::new(POOL);
    pool.virtual_ips.push(VirtualIp {
        ip: "10.0.9.9".to_string(),
        netmask: "255.255.255.0".to_string(),
        bind_interface: "lo".to_string(),
    });
    rig.facade.add_pool(&pool).unwrap();
}

#[test]
fn auto_assignment_picks_from_the_pool_union() {
    let rig = rig();
    seed_pool_ips(&rig);
    let mut svc = service("svc", "");
    svc.endpoints.push(addressed_endpoint());
    rig.facade.add_service(svc).unwrap();

    rig.facade
        .assign_ips(&AssignmentRequest {
            service_id: "svc".to_string(),
            ip_address: String::new(),
            auto_assignment: true,
        })
        .unwrap();

    let fetched = rig.facade.get_service("svc").unwrap();
    let assignment = fetched.endpoints[0].address_assignment.as_ref().unwrap();
    assert!(
        ["10.0.0.1", "10.0.9.9"].contains(&assignment.ip.as_str()),
        "assigned IP must come from the pool union, got {}",
        assignment.ip
    );
    assert_eq!(assignment.port, 5432);

    // Starting now passes validation.
    rig.facade.start_service("svc").unwrap();
}

#[test]
fn manual_assignment_requires_pool_membership() {
    let rig = rig();
    seed_pool_ips(&rig);
    let mut svc = service("svc", "");
    svc.endpoints.push(addressed_endpoint());
    rig.facade.add_service(svc).unwrap();

    let err = rig
        .facade
        .assign_ips(&AssignmentRequest {
            service_id: "svc".to_string(),
            ip_address: "192.168.77.77".to_string(),
            auto_assignment: false,
        })
        .unwrap_err();
    assert!(matches!(err, FacadeError::Precondition(_)));
}

#[test]
fn manual_assignment_replaces_the_existing_one() {
    let rig = rig();
    seed_pool_ips(&rig);
    let mut svc = service("svc", "");
    svc.endpoints.push(addressed_endpoint());
    rig.facade.add_service(svc).unwrap();

    rig.facade
        .assign_ips(&AssignmentRequest {
            service_id: "svc".to_string(),
            ip_address: String::new(),
            auto_assignment: true,
        })
        .unwrap();
    rig.facade
        .assign_ips(&AssignmentRequest {
            service_id: "svc".to_string(),
            ip_address: "10.0.9.9".to_string(),
            auto_assignment: false,
        })
        .unwrap();

    let assignments = rig.facade.catalog().assignments_for_service("svc").unwrap();
    assert_eq!(assignments.len(), 1, "one assignment per endpoint");
    assert_eq!(assignments[0].ip, "10.0.9.9");
    assert_eq!(
        assignments[0].assignment_type,
        harbor_model::AssignmentType::Virtual
    );
    assert!(assignments[0].host_id.is_empty());
}

// ── Endpoint resolution ────────────────────────────────────────────

#[test]
fn imports_resolve_against_live_exporters() {
    let rig = rig();

    let mut db = service("db", "");
    db.endpoints.push(Endpoint::export("pg", "postgres", 5432));
    rig.facade.add_service(db).unwrap();

    let mut app = service("app", "db");
    app.endpoints.push(Endpoint::import("pg", "postgres"));
    rig.facade.add_service(app).unwrap();

    // Publish a running state for the exporter, the way the scheduler and
    // agent do.
    let mut state = ServiceState::new("ss1", "db", "h1", 0);
    state.host_ip = "10.0.0.1".to_string();
    state.private_ip = "172.17.0.2".to_string();
    state.endpoints = rig.facade.get_service("db").unwrap().endpoints;
    state.port_mappings.insert(
        "5432/tcp".to_string(),
        vec![HostIpAndPort {
            host_ip: "10.0.0.1".to_string(),
            host_port: 32768,
        }],
    );
    rig.client
        .create_json(&paths::service_state_node(POOL, "db", "ss1"), &state)
        .unwrap();

    let endpoints = rig.facade.get_service_endpoints("app").unwrap();
    let matches = &endpoints["tcp:5432"];
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].host_ip, "10.0.0.1");
    assert_eq!(matches[0].host_port, 32768);
    assert_eq!(matches[0].container_ip, "172.17.0.2");
}

#[test]
fn exporter_without_states_yields_no_matches() {
    let rig = rig();
    let mut db = service("db", "");
    db.endpoints.push(Endpoint::export("pg", "postgres", 5432));
    rig.facade.add_service(db).unwrap();
    let mut app = service("app", "db");
    app.endpoints.push(Endpoint::import("pg", "postgres"));
    rig.facade.add_service(app).unwrap();

    let endpoints = rig.facade.get_service_endpoints("app").unwrap();
    assert!(endpoints.is_empty());
}

// ── Pool moves and tenants ─────────────────────────────────────────

#[test]
fn pool_change_republishes_under_the_new_pool() {
    let rig = rig();
    rig.facade.add_service(service("svc", "")).unwrap();
    assert!(rig.client.exists(&paths::service_node(POOL, "svc")).unwrap());

    let mut moved = rig.facade.get_service("svc").unwrap();
    moved.pool_id = "other".to_string();
    rig.facade.update_service(moved).unwrap();

    assert!(!rig.client.exists(&paths::service_node(POOL, "svc")).unwrap());
    assert!(rig
        .client
        .exists(&paths::service_node("other", "svc"))
        .unwrap());
}

#[test]
fn tenant_follows_reparenting() {
    let rig = rig();
    rig.facade.add_service(service("t1", "")).unwrap();
    rig.facade.add_service(service("t2", "")).unwrap();
    rig.facade.add_service(service("kid", "t1")).unwrap();
    assert_eq!(rig.facade.tenant_id("kid").unwrap(), "t1");

    let mut kid = rig.facade.get_service("kid").unwrap();
    kid.parent_id = "t2".to_string();
    rig.facade.update_service(kid).unwrap();
    assert_eq!(rig.facade.tenant_id("kid").unwrap(), "t2");
}

#[test]
fn reparenting_cannot_create_a_cycle() {
    let rig = rig();
    rig.facade.add_service(service("a", "")).unwrap();
    rig.facade.add_service(service("b", "a")).unwrap();

    let mut a = rig.facade.get_service("a").unwrap();
    a.parent_id = "b".to_string();
    let err = rig.facade.update_service(a).unwrap_err();
    assert!(matches!(err, FacadeError::InvalidArgument(_)));
}

// ── Users ──────────────────────────────────────────────────────────

#[test]
fn system_user_is_stable_and_validates() {
    let rig = rig();
    let user = rig.facade.get_system_user().unwrap();
    let again = rig.facade.get_system_user().unwrap();
    assert_eq!(user.password, again.password);
    assert!(rig
        .facade
        .validate_credentials(&user.name, &user.password)
        .unwrap());
    assert!(!rig.facade.validate_credentials(&user.name, "nope").unwrap());
}
