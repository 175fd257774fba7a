//! harbord — the Harbor control plane daemon.
//!
//! A single binary that runs the master (service catalog, RPC, per-pool
//! schedulers), the host agent (instance lifecycle plus the traffic mux),
//! or both in one process:
//!
//! ```text
//! harbord --master --listen 0.0.0.0:4979
//! harbord --agent --listen 10.0.0.1:4979 --host-id h1 --mux-port 22250
//! harbord --master --agent --host-id h1
//! ```
//!
//! Exit codes: 0 on clean shutdown, 1 on fatal initialization failure, 2
//! on invalid command-line usage.

use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};

use harbor_coord::Coordinator;
use harbord::{agent_mode, master};

/// Cap on graceful teardown before the daemon just exits.
const SHUTDOWN_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FsType {
    Btrfs,
    Rsync,
}

#[derive(Parser, Debug)]
#[command(name = "harbord", about = "Harbor control plane daemon")]
struct Cli {
    /// Run the master subsystems.
    #[arg(long)]
    master: bool,

    /// Run the host agent.
    #[arg(long)]
    agent: bool,

    /// RPC listen address (master) / master endpoint (agent).
    #[arg(long, default_value = "127.0.0.1:4979")]
    listen: String,

    /// Port of the inbound traffic mux.
    #[arg(long, default_value = "22250")]
    mux_port: u16,

    /// Debug status port (0 disables it).
    #[arg(long, default_value = "0")]
    debug_port: u16,

    /// Terminate TLS on the mux listener.
    #[arg(long)]
    tls: bool,

    /// TLS certificate chain (PEM) for the mux.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS private key (PEM) for the mux.
    #[arg(long)]
    key: Option<PathBuf>,

    /// Local coordination ensemble addresses.
    #[arg(long = "zk", value_delimiter = ',')]
    zk: Vec<String>,

    /// Remote coordination ensemble addresses.
    #[arg(long = "remote-zk", value_delimiter = ',')]
    remote_zk: Vec<String>,

    /// State directory.
    #[arg(long = "var", default_value = "/var/lib/harbor")]
    var_path: PathBuf,

    /// Filesystem driver for tenant volumes.
    #[arg(long, value_enum, default_value = "rsync")]
    fstype: FsType,

    /// Docker registry endpoint (host:port).
    #[arg(long)]
    docker_registry: Option<String>,

    /// Periodically log control-plane statistics.
    #[arg(long)]
    stats: bool,

    /// Statistics period in seconds.
    #[arg(long, default_value = "60")]
    stats_period: u64,

    /// UI port (served by the external web frontend).
    #[arg(long, default_value = "8787")]
    ui_port: u16,

    /// Advertised IP of this host; detected when omitted.
    #[arg(long)]
    outbound_ip: Option<String>,

    /// This host's id (agent mode); falls back to `<var>/host-id`.
    #[arg(long)]
    host_id: Option<String>,

    /// Pool created at first master boot.
    #[arg(long, default_value = "default")]
    pool: String,

    /// Run the in-container endpoint proxy for a service instance.
    #[arg(long, value_name = "SERVICE_ID")]
    proxy: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,harbord=debug,harbor=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    if !cli.master && !cli.agent && cli.proxy.is_none() {
        eprintln!("harbord: at least one of --master, --agent, or --proxy is required");
        exit(2);
    }

    match run(cli).await {
        Ok(()) => {
            info!("harbor daemon stopped");
        }
        Err(err) => {
            error!(error = %err, "fatal initialization failure");
            exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx, cli.master);

    let coordinator = Coordinator::new();
    let mut master_handles = None;
    let mut agent_handles = None;

    if cli.master {
        let opts = master::MasterOptions {
            listen: cli.listen.clone(),
            var_path: cli.var_path.clone(),
            default_pool: cli.pool.clone(),
            zk: cli.zk.clone(),
            remote_zk: cli.remote_zk.clone(),
        };
        master_handles = Some(master::run_master(&coordinator, opts, shutdown_rx.clone()).await?);
    }

    if cli.agent {
        let outbound_ip = cli
            .outbound_ip
            .clone()
            .unwrap_or_else(agent_mode::detect_outbound_ip);
        let opts = agent_mode::AgentOptions {
            master_addr: cli.listen.clone(),
            host_id: cli.host_id.clone(),
            outbound_ip,
            mux_port: cli.mux_port,
            tls: cli.tls,
            cert: cli.cert.clone(),
            key: cli.key.clone(),
            var_path: cli.var_path.clone(),
        };
        agent_handles = Some(agent_mode::run_agent(&coordinator, opts, shutdown_rx.clone()).await?);
    }

    if cli.debug_port > 0 {
        tokio::spawn(debug_listener(cli.debug_port, shutdown_rx.clone()));
    }
    if cli.stats {
        if let Some(handles) = &master_handles {
            tokio::spawn(stats_loop(
                std::sync::Arc::clone(&handles.facade),
                Duration::from_secs(cli.stats_period),
                shutdown_rx.clone(),
            ));
        }
    }
    if let Some(service_id) = cli.proxy.clone() {
        let source = std::sync::Arc::new(harbor_rpc::ControlClient::new(cli.listen.clone()));
        let router = harbor_proxy::ProxyRouter::new(
            service_id,
            source,
            harbor_proxy::Forward::Mux {
                port: cli.mux_port,
                tls: cli.tls,
            },
            std::sync::Arc::new(harbor_proxy::VifRegistry::default()),
        );
        tokio::spawn(router.run(shutdown_rx.clone()));
    }

    if let Some(registry) = cli.docker_registry.as_deref() {
        info!(registry, "docker registry configured");
    }
    info!(fstype = ?cli.fstype, "tenant volume driver registered");
    info!(port = cli.ui_port, "ui port reserved for the web frontend");

    // Block until a signal flips the shutdown channel.
    let mut waiter = shutdown_rx.clone();
    let _ = waiter.changed().await;
    info!("shutdown signal received");

    // Bounded teardown: wait for subsystems, then leave regardless.
    let teardown = async {
        if let Some(handles) = master_handles {
            handles.join().await;
        }
        if let Some(handles) = agent_handles {
            handles.join().await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_CAP, teardown).await.is_err() {
        warn!("timeout waiting for subsystems to stop");
    }
    Ok(())
}

/// SIGINT/SIGTERM flip the shutdown channel; SIGHUP on a master re-execs
/// the binary in place without stopping internal services.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>, is_master: bool) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut hup = signal(SignalKind::hangup()).expect("SIGHUP handler");
        loop {
            tokio::select! {
                _ = term.recv() => {
                    info!("SIGTERM received");
                    let _ = shutdown_tx.send(true);
                    return;
                }
                _ = int.recv() => {
                    info!("SIGINT received");
                    let _ = shutdown_tx.send(true);
                    return;
                }
                _ = hup.recv() => {
                    if is_master {
                        info!("SIGHUP received, re-executing in place");
                        reexec();
                    } else {
                        info!("SIGHUP ignored in agent mode");
                    }
                }
            }
        }
    });
}

/// Replace this process image with a fresh copy of itself.
fn reexec() {
    use std::os::unix::process::CommandExt;
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            error!(error = %err, "could not resolve current executable");
            return;
        }
    };
    let args: Vec<String> = std::env::args().skip(1).collect();
    let err = std::process::Command::new(exe).args(args).exec();
    // exec only returns on failure.
    error!(error = %err, "re-exec failed");
}

/// A tiny status endpoint: connect, read one line, done.
async fn debug_listener(port: u16, mut shutdown: watch::Receiver<bool>) {
    use tokio::io::AsyncWriteExt;
    let listener = match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!(port, error = %err, "could not bind debug port");
            return;
        }
    };
    info!(port, "debug listener started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                if let Ok((mut conn, _)) = accepted {
                    let line = format!("harbord {}\n", env!("CARGO_PKG_VERSION"));
                    let _ = conn.write_all(line.as_bytes()).await;
                }
            }
        }
    }
}

/// Periodic control-plane statistics in the log.
async fn stats_loop(
    facade: std::sync::Arc<harbor_facade::Facade>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {
                let services = facade.get_services().map(|s| s.len()).unwrap_or(0);
                let hosts = facade.catalog().all_hosts().map(|h| h.len()).unwrap_or(0);
                info!(services, hosts, "control plane statistics");
            }
            _ = shutdown.changed() => return,
        }
    }
}
