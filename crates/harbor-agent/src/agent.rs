//! Agent startup, registration, and the host-state listener.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use harbor_coord::{paths, Client, CoordError, WatchEvent, ANY_VERSION};
use harbor_model::Host;

use crate::instance::{instance_loop, InstanceContext};
use crate::master::MasterClient;
use crate::runtime::ContainerRuntime;
use crate::{AgentError, AgentResult};

/// Identity and tunables for one host agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub host_id: String,
    pub host_ip: String,
    pub rpc_port: u16,
    /// Cadence of the pool-discovery poll against the master.
    pub poll_interval: Duration,
    /// SIGTERM-to-SIGKILL escalation window on stop.
    pub stop_timeout: Duration,
}

impl AgentConfig {
    pub fn new(host_id: impl Into<String>, host_ip: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            host_ip: host_ip.into(),
            rpc_port: 0,
            poll_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// The per-host agent.
pub struct HostAgent {
    config: AgentConfig,
    master: Arc<dyn MasterClient>,
    runtime: Arc<dyn ContainerRuntime>,
    coord: Client,
}

impl HostAgent {
    pub fn new(
        config: AgentConfig,
        master: Arc<dyn MasterClient>,
        runtime: Arc<dyn ContainerRuntime>,
        coord: Client,
    ) -> Self {
        Self {
            config,
            master,
            runtime,
            coord,
        }
    }

    /// Run the agent until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> AgentResult<()> {
        // Discover which pool this host belongs to.
        let Some(mut host) = self.discover_host(&mut shutdown).await else {
            return Ok(());
        };
        let pool_id = host.pool_id.clone();
        info!(host = %self.config.host_id, pool = %pool_id, "agent joined pool");

        // Push current facts back to the master.
        host.ip = self.config.host_ip.clone();
        host.rpc_port = self.config.rpc_port;
        if let Err(err) = self.master.update_host(&host).await {
            warn!(error = %err, "could not update host with master");
        }

        // Publish the host node.
        self.coord.ensure_path(&paths::hosts_dir(&pool_id))?;
        let host_path = paths::host_node(&pool_id, &self.config.host_id);
        match self.coord.create_json(&host_path, &host) {
            Ok(()) => {}
            Err(CoordError::AlreadyExists(_)) => {
                self.coord.set_json(&host_path, &host, ANY_VERSION)?;
            }
            Err(err) => return Err(err.into()),
        }

        // Mark this agent alive.
        let presence = paths::host_presence_node(&pool_id, &self.config.host_id);
        match self.coord.create_ephemeral(&presence, b"") {
            Ok(()) | Err(CoordError::AlreadyExists(_)) => {}
            Err(err) => return Err(err.into()),
        }
        info!(host = %self.config.host_id, "agent presence registered");

        // No instance work before the storage leader is ready.
        if !self.wait_for_storage(&mut shutdown).await {
            if let Err(err) = self.coord.delete(&presence, ANY_VERSION) {
                debug!(error = %err, "presence node already gone");
            }
            return Ok(());
        }

        // Announce this host as a storage client.
        self.coord.ensure_path("/storage/clients")?;
        match self
            .coord
            .create_ephemeral(&paths::storage_client(&self.config.host_ip), b"")
        {
            Ok(()) | Err(CoordError::AlreadyExists(_)) => {}
            Err(err) => warn!(error = %err, "could not register storage client"),
        }

        let result = self.listen(&pool_id, &mut shutdown).await;

        // Housekeeping: withdraw presence so the scheduler stops placing
        // work here.
        if let Err(err) = self.coord.delete(&presence, ANY_VERSION) {
            debug!(error = %err, "presence node already gone");
        }
        info!(host = %self.config.host_id, "agent stopped");
        result
    }

    /// Poll the master until it knows this host (or shutdown).
    async fn discover_host(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Host> {
        loop {
            match self.master.get_host(&self.config.host_id).await {
                Ok(Some(host)) => return Some(host),
                Ok(None) => {
                    warn!(host = %self.config.host_id, "host not yet registered with master");
                }
                Err(err) => {
                    warn!(error = %err, "could not reach master, retrying");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => return None,
            }
        }
    }

    /// Block until the storage leader node exists, complaining every 30 s.
    async fn wait_for_storage(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            match self.coord.exists_w(&paths::storage_leader()) {
                Ok((true, _)) => return true,
                Ok((false, rx)) => {
                    tokio::select! {
                        _ = rx => {}
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {
                            info!("waiting for storage leader to be ready");
                        }
                        _ = shutdown.changed() => return false,
                    }
                }
                Err(err) => {
                    warn!(error = %err, "could not check storage leader");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.changed() => return false,
                    }
                }
            }
        }
    }

    /// Watch the host node's children and keep one instance loop per
    /// state id alive.
    async fn listen(&self, pool_id: &str, shutdown: &mut watch::Receiver<bool>) -> AgentResult<()> {
        let host_path = paths::host_node(pool_id, &self.config.host_id);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
        let mut processing: HashSet<String> = HashSet::new();

        loop {
            let (children, event) = match self.coord.children_w(&host_path) {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "could not watch host states");
                    break;
                }
            };

            for state_id in children {
                if state_id == paths::PRESENCE_CHILD || processing.contains(&state_id) {
                    continue;
                }
                debug!(state = %state_id, "spawning instance loop");
                processing.insert(state_id.clone());
                let ctx = InstanceContext {
                    pool_id: pool_id.to_string(),
                    host_id: self.config.host_id.clone(),
                    coord: self.coord.clone(),
                    master: Arc::clone(&self.master),
                    runtime: Arc::clone(&self.runtime),
                    stop_timeout: self.config.stop_timeout,
                };
                tokio::spawn(instance_loop(
                    ctx,
                    state_id,
                    done_tx.clone(),
                    shutdown.clone(),
                ));
            }

            tokio::select! {
                ev = event => {
                    debug!(?ev, "host state event");
                    if matches!(ev, Ok(WatchEvent::Expired)) {
                        return Err(AgentError::Coord(CoordError::SessionExpired));
                    }
                }
                Some(state_id) = done_rx.recv() => {
                    debug!(state = %state_id, "instance loop finished");
                    processing.remove(&state_id);
                }
                _ = shutdown.changed() => break,
            }
        }

        // Drain: instance loops observe the same shutdown signal; wait for
        // each to report done.
        drop(done_tx);
        while !processing.is_empty() {
            match tokio::time::timeout(Duration::from_secs(60), done_rx.recv()).await {
                Ok(Some(state_id)) => {
                    processing.remove(&state_id);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = processing.len(), "timeout draining instance loops");
                    break;
                }
            }
        }
        Ok(())
    }
}
