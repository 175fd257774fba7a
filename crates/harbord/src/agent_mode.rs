//! Agent mode: the host agent plus the inbound traffic mux.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use harbor_agent::{AgentConfig, ContainerRuntime, HostAgent, MasterClient};
use harbor_coord::Coordinator;
use harbor_mux::{ConnectionRegistry, MuxConfig, TcpMux, TlsIdentity, TlsMux};
use harbor_rpc::ControlClient;

use crate::fs;
use crate::runtime::ProcessRuntime;

/// Settings for agent mode.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Master RPC endpoint (host:port).
    pub master_addr: String,
    /// Explicit host id; falls back to `<var>/host-id`.
    pub host_id: Option<String>,
    /// Address advertised for this host.
    pub outbound_ip: String,
    pub mux_port: u16,
    pub tls: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub var_path: PathBuf,
}

/// Live agent subsystems.
pub struct AgentHandles {
    pub mux_registry: Arc<ConnectionRegistry>,
    pub mux_addr: std::net::SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandles {
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Bring up the host agent and the mux.
pub async fn run_agent(
    coordinator: &Coordinator,
    opts: AgentOptions,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<AgentHandles> {
    info!("harbor daemon starting in agent mode");

    // A host without an identity cannot participate.
    let host_id = match &opts.host_id {
        Some(id) => id.clone(),
        None => {
            let file = fs::host_id_file(&opts.var_path);
            std::fs::read_to_string(&file)
                .map(|s| s.trim().to_string())
                .ok()
                .filter(|s| !s.is_empty())
                .with_context(|| {
                    format!("host id missing: pass --host-id or create {}", file.display())
                })?
        }
    };
    info!(host = %host_id, ip = %opts.outbound_ip, "agent identity resolved");

    let mut tasks = Vec::new();

    // ── Mux ────────────────────────────────────────────────────────
    let mux_registry = Arc::new(ConnectionRegistry::new());
    let mux_listener = TcpListener::bind(("0.0.0.0", opts.mux_port))
        .await
        .with_context(|| format!("binding mux on port {}", opts.mux_port))?;
    let mux_addr = mux_listener.local_addr()?;
    let mux_config = MuxConfig::new(host_id.clone(), opts.outbound_ip.clone());
    if opts.tls {
        let identity = match (&opts.cert, &opts.key) {
            (Some(cert), Some(key)) => TlsIdentity::from_pem_files(cert, key)
                .context("loading TLS chain for the mux")?,
            _ => TlsIdentity::insecure_dev().context("building dev TLS identity")?,
        };
        let mux = TlsMux::new(
            mux_listener,
            identity,
            Arc::clone(&mux_registry),
            mux_config,
        )
        .context("building TLS mux")?;
        info!(port = opts.mux_port, "tls mux listening");
        tasks.push(tokio::spawn(mux.run(shutdown.clone())));
    } else {
        let mux = TcpMux::new(mux_listener, Arc::clone(&mux_registry), mux_config);
        info!(port = opts.mux_port, "mux listening");
        tasks.push(tokio::spawn(mux.run(shutdown.clone())));
    }

    // ── Host agent ─────────────────────────────────────────────────
    let master: Arc<dyn MasterClient> = Arc::new(ControlClient::new(opts.master_addr.clone()));
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(ProcessRuntime::new());
    let mut config = AgentConfig::new(host_id, opts.outbound_ip.clone());
    config.rpc_port = opts.mux_port;
    let agent = HostAgent::new(config, master, runtime, coordinator.connect());
    tasks.push(tokio::spawn(async move {
        if let Err(err) = agent.run(shutdown).await {
            tracing::error!(error = %err, "host agent exited with error");
        }
    }));

    Ok(AgentHandles {
        mux_registry,
        mux_addr,
        tasks,
    })
}

/// Best-effort detection of the default outbound IP.
pub fn detect_outbound_ip() -> String {
    // Connecting a UDP socket performs no traffic; it only selects the
    // route and local address.
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:53")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_ip_is_well_formed() {
        let ip = detect_outbound_ip();
        assert!(ip.parse::<std::net::IpAddr>().is_ok());
    }
}
