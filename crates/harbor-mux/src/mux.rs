//! The plaintext mux listener and the shared per-connection handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::header::MuxHeader;
use crate::registry::{ConnectionInfo, ConnectionRegistry};
use crate::{MuxError, MuxResult};

/// How long an inbound connection has to present its header line.
const HEADER_DEADLINE: Duration = Duration::from_secs(5);

/// Pause before retrying `accept` after running out of file descriptors.
const EMFILE_RETRY: Duration = Duration::from_millis(50);

/// Identity and tunables for one mux instance.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub host_id: String,
    pub host_ip: String,
    /// Bound on the backend dial.
    pub dial_timeout: Duration,
}

impl MuxConfig {
    pub fn new(host_id: impl Into<String>, host_ip: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            host_ip: host_ip.into(),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// The single-port TCP multiplexer.
pub struct TcpMux {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    config: MuxConfig,
}

impl TcpMux {
    pub fn new(listener: TcpListener, registry: Arc<ConnectionRegistry>, config: MuxConfig) -> Self {
        Self {
            listener,
            registry,
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until shutdown.
    ///
    /// Running out of file descriptors backs off briefly and retries; any
    /// other accept error is terminal for the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("mux accept loop shutting down");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        let registry = Arc::clone(&self.registry);
                        let config = self.config.clone();
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let local = conn.local_addr().ok();
                            if let Err(err) =
                                serve_connection(conn, peer, local, registry, config, conn_shutdown).await
                            {
                                debug!(%peer, error = %err, "mux connection ended with error");
                            }
                        });
                    }
                    Err(err) if is_fd_exhaustion(&err) => {
                        warn!(error = %err, "accept failed, retrying in 50ms");
                        tokio::select! {
                            _ = tokio::time::sleep(EMFILE_RETRY) => {}
                            _ = shutdown.changed() => return,
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "terminal accept error, shutting down mux");
                        return;
                    }
                }
            }
        }
    }
}

fn is_fd_exhaustion(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EMFILE)
        || err.raw_os_error() == Some(libc::ENFILE)
        || err.to_string().contains("too many open files")
}

/// Read the header, dial the backend, splice.
///
/// Shared by the plain and TLS listeners.
pub(crate) async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    registry: Arc<ConnectionRegistry>,
    config: MuxConfig,
    mut shutdown: watch::Receiver<bool>,
) -> MuxResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Bound only the header read; the copy phase has no deadline.
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    match tokio::time::timeout(HEADER_DEADLINE, reader.read_until(b'\n', &mut line)).await {
        Err(_) => {
            warn!(%peer, "timed out reading mux header");
            return Err(MuxError::HeaderTimeout);
        }
        Ok(Err(err)) => {
            warn!(%peer, error = %err, "could not read mux header");
            return Err(err.into());
        }
        Ok(Ok(0)) => {
            debug!(%peer, "connection closed before header");
            return Ok(());
        }
        Ok(Ok(_)) => {}
    }

    let text = String::from_utf8_lossy(&line);
    let header = match MuxHeader::parse(text.trim_end()) {
        Ok(header) => header,
        Err(err) => {
            warn!(%peer, line = %text.trim_end(), "malformed mux header");
            return Err(err);
        }
    };

    let backend_addr = format!("{}:{}", header.dst_host, header.dst_port);
    let mut backend = match dial_tcp4(&backend_addr, config.dial_timeout).await {
        Ok(backend) => backend,
        Err(err) => {
            warn!(%peer, backend = %backend_addr, error = %err, "could not dial backend");
            return Err(err);
        }
    };

    // Bytes the client sent past the newline belong to the backend.
    let buffered = reader.buffer().to_vec();
    if !buffered.is_empty() {
        backend.write_all(&buffered).await?;
    }
    let client = reader.into_inner();

    let info = ConnectionInfo {
        agent_host_ip: config.host_ip.clone(),
        agent_host_id: config.host_id.clone(),
        src: header.source.clone().unwrap_or_default(),
        src_remote_addr: peer.to_string(),
        src_local_addr: local.map(|a| a.to_string()).unwrap_or_default(),
        dst_local_addr: backend
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default(),
        dst_remote_addr: backend
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default(),
        dst_name: header.dst_name.clone(),
        endpoint: header.endpoint.clone(),
        active_writers: 1,
        created_at: SystemTime::now(),
    };
    let key = registry.register(info);

    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);
    let mut upstream = tokio::spawn(pump(client_read, backend_write));
    let mut downstream = tokio::spawn(pump(backend_read, client_write));

    let mut sent = 0u64;
    let mut received = 0u64;
    let mut finished = 0;
    while finished < 2 {
        tokio::select! {
            up = &mut upstream, if !upstream.is_finished() => {
                sent = up.unwrap_or(0);
                finished += 1;
            }
            down = &mut downstream, if !downstream.is_finished() => {
                received = down.unwrap_or(0);
                finished += 1;
            }
            _ = shutdown.changed() => {
                // Explicit quit: interrupt both copy loops.
                upstream.abort();
                downstream.abort();
                break;
            }
        }
    }

    registry.release(&key);
    debug!(%peer, backend = %backend_addr, sent, received, "mux connection closed");
    Ok(())
}

/// One direction of the splice. Returns bytes transferred.
///
/// Clean EOF and read errors half-close the write side so the peer sees
/// FIN; a broken-pipe write means the far side already shut down, so the
/// loop just stops and lets its read half drop.
async fn pump<R, W>(mut from: R, mut to: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        match from.read(&mut buf).await {
            Ok(0) => {
                let _ = to.shutdown().await;
                return total;
            }
            Ok(n) => {
                if let Err(err) = to.write_all(&buf[..n]).await {
                    if err.kind() != std::io::ErrorKind::BrokenPipe {
                        let _ = to.shutdown().await;
                    }
                    return total;
                }
                total += n as u64;
            }
            Err(_) => {
                let _ = to.shutdown().await;
                return total;
            }
        }
    }
}

/// Dial an IPv4 TCP backend within the timeout.
pub(crate) async fn dial_tcp4(addr: &str, timeout: Duration) -> MuxResult<TcpStream> {
    let map_err = |e: std::io::Error| MuxError::Dial {
        addr: addr.to_string(),
        source: e,
    };
    let target = tokio::net::lookup_host(addr)
        .await
        .map_err(map_err)?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| MuxError::Dial {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no IPv4 address"),
        })?;
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(map_err(err)),
        Err(_) => Err(MuxError::Dial {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn start_echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn start_mux(registry: Arc<ConnectionRegistry>) -> (SocketAddr, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mux = TcpMux::new(listener, registry, MuxConfig::new("h1", "127.0.0.1"));
        let (tx, rx) = watch::channel(false);
        tokio::spawn(mux.run(rx));
        (addr, tx)
    }

    #[tokio::test]
    async fn roundtrip_through_the_mux() {
        let backend = start_echo_backend().await;
        let registry = Arc::new(ConnectionRegistry::new());
        let (mux_addr, _shutdown) = start_mux(Arc::clone(&registry)).await;

        let mut client = TcpStream::connect(mux_addr).await.unwrap();
        client
            .write_all(format!("127.0.0.1:{}\n", backend.port()).as_bytes())
            .await
            .unwrap();
        client.write_all(b"HELLO").await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO");

        // And the reverse direction keeps flowing.
        client.write_all(b" again").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b" again");
    }

    #[tokio::test]
    async fn header_and_payload_in_one_write() {
        // Bytes buffered past the newline must reach the backend verbatim.
        let backend = start_echo_backend().await;
        let registry = Arc::new(ConnectionRegistry::new());
        let (mux_addr, _shutdown) = start_mux(Arc::clone(&registry)).await;

        let mut client = TcpStream::connect(mux_addr).await.unwrap();
        let message = format!("127.0.0.1:{}\nHELLO", backend.port());
        client.write_all(message.as_bytes()).await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO");
    }

    #[tokio::test]
    async fn accounting_drains_when_connection_closes() {
        let backend = start_echo_backend().await;
        let registry = Arc::new(ConnectionRegistry::new());
        let (mux_addr, _shutdown) = start_mux(Arc::clone(&registry)).await;

        let mut client = TcpStream::connect(mux_addr).await.unwrap();
        client
            .write_all(format!("127.0.0.1:{}\nping", backend.port()).as_bytes())
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(registry.len(), 1);

        drop(client);
        for _ in 0..50 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(registry.is_empty(), "connection info should drain to zero");
    }

    #[tokio::test]
    async fn malformed_header_closes_the_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mux_addr, _shutdown) = start_mux(Arc::clone(&registry)).await;

        let mut client = TcpStream::connect(mux_addr).await.unwrap();
        client.write_all(b"nocolonatall\n").await.unwrap();

        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "mux should close after malformed header");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unreachable_backend_closes_the_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mux_addr, _shutdown) = start_mux(Arc::clone(&registry)).await;

        let mut client = TcpStream::connect(mux_addr).await.unwrap();
        // Port 1 should refuse quickly.
        client.write_all(b"127.0.0.1:1\n").await.unwrap();

        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dial_tcp4_times_out() {
        // 203.0.113.0/24 is TEST-NET-3, guaranteed unrouteable.
        let result = dial_tcp4("203.0.113.1:9", Duration::from_millis(200)).await;
        assert!(result.is_err());
    }
}
