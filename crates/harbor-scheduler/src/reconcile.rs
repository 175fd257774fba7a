//! The leader-elected reconciliation loop.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use harbor_coord::{paths, Backoff, Client, CoordError, LeaderElection, WatchRx, ANY_VERSION};
use harbor_model::{DesiredState, Host, HostId, HostState, Launch, Service, ServiceId, ServiceState};

use crate::selection::{next_instance_id, select_hosts, HostCandidate};
use crate::{SchedulerError, SchedulerResult};

/// RAM committed per host plus per-host instance counts per service,
/// maintained across one reconciliation pass.
#[derive(Default)]
struct PoolLoad {
    ram: HashMap<HostId, u64>,
    per_service: HashMap<(HostId, ServiceId), u32>,
}

impl PoolLoad {
    fn record(&mut self, host_id: &str, service_id: &str, ram: u64) {
        *self.ram.entry(host_id.to_string()).or_default() += ram;
        *self
            .per_service
            .entry((host_id.to_string(), service_id.to_string()))
            .or_default() += 1;
    }
}

/// The per-pool scheduler.
pub struct Scheduler {
    pool_id: String,
    coord: Client,
    debounce: Duration,
}

impl Scheduler {
    pub fn new(pool_id: impl Into<String>, coord: Client) -> Self {
        Self {
            pool_id: pool_id.into(),
            coord,
            debounce: Duration::from_millis(250),
        }
    }

    /// Override the watch debounce (tests).
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Contend for pool leadership and reconcile while holding it.
    ///
    /// Lost leadership halts reconciliation immediately and re-enters the
    /// campaign; shutdown ends the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let election = LeaderElection::new(
            self.coord.clone(),
            paths::scheduler_leader(&self.pool_id),
            self.pool_id.clone().into_bytes(),
        );
        let mut backoff = Backoff::new();
        loop {
            match election.campaign(&mut shutdown).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    warn!(pool = %self.pool_id, error = %err, "scheduler election failed");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff.next()) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            }
            backoff.reset();
            info!(pool = %self.pool_id, "scheduler leading");
            let lost = self.lead(&election, &mut shutdown).await;
            election.resign();
            if !lost {
                info!(pool = %self.pool_id, "scheduler shutting down");
                return;
            }
            info!(pool = %self.pool_id, "scheduler leadership lost, rejoining election");
        }
    }

    /// Reconcile until leadership is lost (true) or shutdown (false).
    async fn lead(&self, election: &LeaderElection, shutdown: &mut watch::Receiver<bool>) -> bool {
        if let Err(err) = self.ensure_layout() {
            warn!(pool = %self.pool_id, error = %err, "could not prepare pool namespace");
            return true;
        }
        let mut backoff = Backoff::new();
        loop {
            match self.reconcile() {
                Ok(()) => backoff.reset(),
                Err(err) => {
                    warn!(pool = %self.pool_id, error = %err, "reconciliation failed");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff.next()) => {}
                        _ = shutdown.changed() => return false,
                    }
                }
            }

            let watches = self.arm_watches();
            let leadership = match election.watch_leadership() {
                Ok(rx) => rx,
                // The election node is gone: leadership is lost.
                Err(_) => return true,
            };

            if watches.is_empty() {
                tokio::select! {
                    _ = leadership => return true,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    _ = shutdown.changed() => return false,
                }
            }

            tokio::select! {
                _ = leadership => return true,
                (event, _, _) = select_all(watches) => {
                    debug!(pool = %self.pool_id, ?event, "scheduler watch fired");
                    // Debounce: absorb the burst before reconciling.
                    tokio::select! {
                        _ = tokio::time::sleep(self.debounce) => {}
                        _ = shutdown.changed() => return false,
                    }
                }
                _ = shutdown.changed() => return false,
            }
        }
    }

    fn ensure_layout(&self) -> SchedulerResult<()> {
        self.coord.ensure_path(&paths::services_dir(&self.pool_id))?;
        self.coord.ensure_path(&paths::hosts_dir(&self.pool_id))?;
        Ok(())
    }

    /// Arm one-shot watches over everything that should trigger a pass:
    /// the service directory, every service node and its state children,
    /// and every host's children (presence and host-states).
    fn arm_watches(&self) -> Vec<WatchRx> {
        let mut rxs = Vec::new();
        if let Ok((services, rx)) = self.coord.children_w(&paths::services_dir(&self.pool_id)) {
            rxs.push(rx);
            for service_id in services {
                let node = paths::service_node(&self.pool_id, &service_id);
                if let Ok((_, _, rx)) = self.coord.get_w(&node) {
                    rxs.push(rx);
                }
                if let Ok((_, rx)) = self.coord.children_w(&node) {
                    rxs.push(rx);
                }
            }
        }
        if let Ok((hosts, rx)) = self.coord.children_w(&paths::hosts_dir(&self.pool_id)) {
            rxs.push(rx);
            for host_id in hosts {
                if let Ok((_, rx)) = self
                    .coord
                    .children_w(&paths::host_node(&self.pool_id, &host_id))
                {
                    rxs.push(rx);
                }
            }
        }
        rxs
    }

    /// One full reconciliation pass over the pool.
    pub fn reconcile(&self) -> SchedulerResult<()> {
        let services = self.load_services()?;
        let hosts = self.alive_hosts()?;
        let mut load = PoolLoad::default();
        let mut states_by_service: HashMap<ServiceId, Vec<ServiceState>> = HashMap::new();

        for svc in &services {
            let states = self.load_states(&svc.id)?;
            for state in &states {
                load.record(&state.host_id, &svc.id, svc.ram_commitment);
            }
            states_by_service.insert(svc.id.clone(), states);
        }

        for svc in &services {
            let states = states_by_service.remove(&svc.id).unwrap_or_default();
            self.reconcile_service(svc, states, &hosts, &mut load)?;
        }
        Ok(())
    }

    fn reconcile_service(
        &self,
        svc: &Service,
        states: Vec<ServiceState>,
        hosts: &[Host],
        load: &mut PoolLoad,
    ) -> SchedulerResult<()> {
        // Garbage-collect instances stranded on dead hosts; their agent
        // cannot stop them and the pool should converge without them.
        let mut live = Vec::new();
        for state in states {
            if hosts.iter().any(|h| h.id == state.host_id) {
                live.push(state);
            } else {
                info!(
                    service = %svc.id,
                    state = %state.id,
                    host = %state.host_id,
                    "removing instance from dead host"
                );
                self.remove_instance(&state);
                load.ram
                    .entry(state.host_id.clone())
                    .and_modify(|r| *r = r.saturating_sub(svc.ram_commitment));
            }
        }

        match (svc.desired_state, svc.launch) {
            (DesiredState::Run, Launch::Auto) => {
                let current = live.len() as u32;
                let target = svc.instances;
                if current < target {
                    self.scale_up(svc, &live, hosts, load, target - current)?;
                } else if current > target {
                    self.scale_down(svc, &live, current - target);
                }
            }
            (DesiredState::Run, Launch::Manual) => {
                // Manual services are launched through the RPC surface,
                // never by the reconciler.
            }
            (desired @ (DesiredState::Stop | DesiredState::Pause), _) => {
                for state in &live {
                    self.set_host_state_desired(state, desired);
                }
            }
        }
        Ok(())
    }

    fn scale_up(
        &self,
        svc: &Service,
        live: &[ServiceState],
        hosts: &[Host],
        load: &mut PoolLoad,
        missing: u32,
    ) -> SchedulerResult<()> {
        let mut used_ids: Vec<u32> = live.iter().map(|s| s.instance_id).collect();
        for _ in 0..missing {
            let candidates: Vec<HostCandidate> = hosts
                .iter()
                .map(|host| HostCandidate {
                    committed_ram: load.ram.get(&host.id).copied().unwrap_or(0),
                    same_service_instances: load
                        .per_service
                        .get(&(host.id.clone(), svc.id.clone()))
                        .copied()
                        .unwrap_or(0),
                    host: host.clone(),
                })
                .collect();
            let ranked = select_hosts(&candidates, svc.ram_commitment);
            let Some(best) = ranked.first() else {
                return Err(SchedulerError::NoEligibleHost {
                    service_id: svc.id.clone(),
                    needed: svc.ram_commitment,
                });
            };

            let instance_id = next_instance_id(&used_ids);
            used_ids.push(instance_id);
            let host = best.host.clone();
            self.create_instance(svc, &host, instance_id)?;
            load.record(&host.id, &svc.id, svc.ram_commitment);
        }
        Ok(())
    }

    /// Mark the newest surplus instances for stop; the owning agents
    /// delete the nodes once the processes are down.
    fn scale_down(&self, svc: &Service, live: &[ServiceState], surplus: u32) {
        let mut doomed: Vec<&ServiceState> = live.iter().collect();
        doomed.sort_by(|a, b| b.instance_id.cmp(&a.instance_id));
        for state in doomed.into_iter().take(surplus as usize) {
            info!(
                service = %svc.id,
                instance = state.instance_id,
                host = %state.host_id,
                "marking surplus instance for stop"
            );
            self.set_host_state_desired(state, DesiredState::Stop);
        }
    }

    /// Create the `ServiceState`/`HostState` pair for a new instance.
    ///
    /// The service-state node is created first; if the host-state create
    /// fails the first node is rolled back. `AlreadyExists` means a crash
    /// retry beat us to it and counts as success.
    fn create_instance(&self, svc: &Service, host: &Host, instance_id: u32) -> SchedulerResult<()> {
        let state_id = uuid::Uuid::new_v4().to_string();
        let mut state = ServiceState::new(state_id.clone(), svc.id.clone(), host.id.clone(), instance_id);
        state.host_ip = host.ip.clone();
        state.endpoints = svc.endpoints.clone();

        let spath = paths::service_state_node(&self.pool_id, &svc.id, &state_id);
        match self.coord.create_json(&spath, &state) {
            Ok(()) | Err(CoordError::AlreadyExists(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let hpath = paths::host_state_node(&self.pool_id, &host.id, &state_id);
        match self.coord.create_json(&hpath, &HostState::for_state(&state)) {
            Ok(()) | Err(CoordError::AlreadyExists(_)) => {}
            Err(err) => {
                if let Err(cleanup) = self.coord.delete(&spath, ANY_VERSION) {
                    warn!(path = %spath, error = %cleanup, "could not roll back service state");
                }
                return Err(err.into());
            }
        }

        info!(
            service = %svc.id,
            host = %host.id,
            instance = instance_id,
            state = %state_id,
            "instance scheduled"
        );
        Ok(())
    }

    fn set_host_state_desired(&self, state: &ServiceState, desired: DesiredState) {
        let path = paths::host_state_node(&self.pool_id, &state.host_id, &state.id);
        match self.coord.get_json::<HostState>(&path) {
            Ok((mut hs, version)) => {
                if hs.desired_state == desired {
                    return;
                }
                hs.desired_state = desired;
                if let Err(err) = self.coord.set_json(&path, &hs, version) {
                    warn!(%path, error = %err, "could not update host state");
                }
            }
            // Deleted out from under us: the agent already retired it.
            Err(CoordError::NotFound(_)) => {}
            Err(err) => warn!(%path, error = %err, "could not load host state"),
        }
    }

    /// Delete both nodes of an instance (dead-host garbage collection).
    fn remove_instance(&self, state: &ServiceState) {
        let hpath = paths::host_state_node(&self.pool_id, &state.host_id, &state.id);
        match self.coord.delete(&hpath, ANY_VERSION) {
            Ok(()) | Err(CoordError::NotFound(_)) => {}
            Err(err) => warn!(path = %hpath, error = %err, "could not delete host state"),
        }
        let spath = paths::service_state_node(&self.pool_id, &state.service_id, &state.id);
        match self.coord.delete(&spath, ANY_VERSION) {
            Ok(()) | Err(CoordError::NotFound(_)) => {}
            Err(err) => warn!(path = %spath, error = %err, "could not delete service state"),
        }
    }

    fn load_services(&self) -> SchedulerResult<Vec<Service>> {
        let dir = paths::services_dir(&self.pool_id);
        let ids = match self.coord.children(&dir) {
            Ok(ids) => ids,
            Err(CoordError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut services = Vec::new();
        for id in ids {
            match self
                .coord
                .get_json::<Service>(&paths::service_node(&self.pool_id, &id))
            {
                Ok((svc, _)) => services.push(svc),
                // Raced with a removal.
                Err(CoordError::NotFound(_)) => {}
                Err(err) => {
                    warn!(service = %id, error = %err, "unreadable service node, skipping");
                }
            }
        }
        Ok(services)
    }

    fn load_states(&self, service_id: &str) -> SchedulerResult<Vec<ServiceState>> {
        let node = paths::service_node(&self.pool_id, service_id);
        let ids = match self.coord.children(&node) {
            Ok(ids) => ids,
            Err(CoordError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut states = Vec::new();
        for id in ids {
            match self
                .coord
                .get_json::<ServiceState>(&paths::service_state_node(&self.pool_id, service_id, &id))
            {
                Ok((state, _)) => states.push(state),
                Err(CoordError::NotFound(_)) => {}
                Err(err) => {
                    warn!(state = %id, error = %err, "unreadable service state, skipping");
                }
            }
        }
        Ok(states)
    }

    /// Hosts in the pool whose agents hold a live presence node.
    fn alive_hosts(&self) -> SchedulerResult<Vec<Host>> {
        let dir = paths::hosts_dir(&self.pool_id);
        let ids = match self.coord.children(&dir) {
            Ok(ids) => ids,
            Err(CoordError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut hosts = Vec::new();
        for id in ids {
            let presence = paths::host_presence_node(&self.pool_id, &id);
            if !self.coord.exists(&presence)? {
                continue;
            }
            match self
                .coord
                .get_json::<Host>(&paths::host_node(&self.pool_id, &id))
            {
                Ok((host, _)) => hosts.push(host),
                Err(CoordError::NotFound(_)) => {}
                Err(err) => {
                    warn!(host = %id, error = %err, "unreadable host node, skipping");
                }
            }
        }
        Ok(hosts)
    }
}
