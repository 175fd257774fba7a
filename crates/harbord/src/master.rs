//! Master mode: catalog, RPC surface, publish reconciler, and one
//! scheduler per pool.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use harbor_coord::{paths, Connections, Coordinator};
use harbor_facade::Facade;
use harbor_model::Pool;
use harbor_rpc::RpcServer;
use harbor_scheduler::Scheduler;
use harbor_state::Catalog;

use crate::fs;

/// Settings for master mode.
#[derive(Debug, Clone)]
pub struct MasterOptions {
    /// RPC listen address (host:port).
    pub listen: String,
    pub var_path: PathBuf,
    /// Pool created at first boot so hosts have somewhere to land.
    pub default_pool: String,
    /// Local coordination ensemble addresses (informational; the
    /// embedded coordinator serves the namespace).
    pub zk: Vec<String>,
    /// Remote ensemble addresses; unreachable remotes put the master in
    /// disconnected mode rather than failing startup.
    pub remote_zk: Vec<String>,
}

/// Live master subsystems.
pub struct MasterHandles {
    pub facade: Arc<Facade>,
    pub rpc_addr: std::net::SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl MasterHandles {
    /// Wait for every master task to wind down.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Bring up the master subsystems on the given coordinator.
pub async fn run_master(
    coordinator: &Coordinator,
    opts: MasterOptions,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<MasterHandles> {
    info!("harbor daemon starting in master mode");
    std::fs::create_dir_all(&opts.var_path)
        .with_context(|| format!("creating {}", opts.var_path.display()))?;

    // Stable identifiers for the internal service cluster.
    let es_cluster = fs::cluster_name(&opts.var_path, "elasticsearch")?;
    info!(cluster = %es_cluster, "internal service cluster name loaded");

    // ── Catalog ────────────────────────────────────────────────────
    let db_path = opts.var_path.join("harbor.redb");
    let catalog = Catalog::open(&db_path).context("opening catalog")?;
    info!(path = %db_path.display(), "catalog opened");

    if catalog.get_pool(&opts.default_pool)?.is_none() {
        catalog.put_pool(&Pool::new(&opts.default_pool))?;
        info!(pool = %opts.default_pool, "default pool created");
    }

    // ── Coordination ───────────────────────────────────────────────
    if !opts.zk.is_empty() {
        info!(ensemble = ?opts.zk, "coordination ensemble configured, serving embedded namespace");
    }
    if !opts.remote_zk.is_empty() {
        warn!(
            ensemble = ?opts.remote_zk,
            "remote ensemble unreachable from this build, running in disconnected mode"
        );
    }
    let conns = Connections::new(coordinator.connect(), None, Vec::new());

    // The embedded master doubles as the storage leader; agents gate
    // instance work on this node.
    conns.local().ensure_path(&paths::storage_leader())?;

    // ── Facade + publish reconciler ────────────────────────────────
    let (facade, reconciler) = Facade::new(catalog.clone(), conns);
    let facade = Arc::new(facade);
    facade.get_system_user()?;

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(reconciler.run(shutdown.clone())));

    // ── RPC ────────────────────────────────────────────────────────
    let listener = TcpListener::bind(&opts.listen)
        .await
        .with_context(|| format!("binding rpc listener on {}", opts.listen))?;
    let rpc_addr = listener.local_addr()?;
    tasks.push(tokio::spawn(
        RpcServer::new(Arc::clone(&facade)).serve(listener, shutdown.clone()),
    ));

    // ── Schedulers, one per pool ───────────────────────────────────
    tasks.push(tokio::spawn(scheduler_supervisor(
        coordinator.clone(),
        catalog,
        shutdown,
    )));

    Ok(MasterHandles {
        facade,
        rpc_addr,
        tasks,
    })
}

/// Keep one scheduler running per catalog pool, picking up pools added
/// after startup.
async fn scheduler_supervisor(
    coordinator: Coordinator,
    catalog: Catalog,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut running: HashSet<String> = HashSet::new();
    let mut handles = Vec::new();
    loop {
        match catalog.all_pools() {
            Ok(pools) => {
                for pool in pools {
                    if running.insert(pool.id.clone()) {
                        info!(pool = %pool.id, "starting pool scheduler");
                        let scheduler = Scheduler::new(pool.id, coordinator.connect());
                        handles.push(tokio::spawn(scheduler.run(shutdown.clone())));
                    }
                }
            }
            Err(err) => warn!(error = %err, "could not list pools"),
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            _ = shutdown.changed() => break,
        }
    }
    for handle in handles {
        let _ = handle.await;
    }
}
