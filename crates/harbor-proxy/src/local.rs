//! A single local listener proxying to a rotating remote address set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use harbor_mux::MuxHeader;

use crate::ProxyResult;

/// How an outbound connection reaches the remote instance.
#[derive(Debug, Clone)]
pub enum Forward {
    /// Dial the published host:port directly.
    Direct,
    /// Dial the remote host's mux port and present a header naming the
    /// published port; `tls` wraps the dial in TLS.
    Mux { port: u16, tls: bool },
}

/// A local `tcp4` listener for one endpoint key.
///
/// The address set is swapped atomically by [`set_new_addresses`]
/// (`LocalProxy::set_new_addresses`); an empty set rejects new
/// connections while leaving established ones alone.
pub struct LocalProxy {
    addresses: Arc<RwLock<Vec<String>>>,
    cursor: Arc<AtomicUsize>,
}

impl LocalProxy {
    /// Start serving on an already-bound listener.
    pub fn spawn(
        listener: TcpListener,
        forward: Forward,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let addresses: Arc<RwLock<Vec<String>>> = Arc::new(RwLock::new(Vec::new()));
        // Random initial offset so a fleet of fresh proxies doesn't pile
        // onto the same remote.
        let cursor = Arc::new(AtomicUsize::new(rand::random::<u16>() as usize));

        let accept_addresses = Arc::clone(&addresses);
        let accept_cursor = Arc::clone(&cursor);
        tokio::spawn(accept_loop(
            listener,
            forward,
            accept_addresses,
            accept_cursor,
            shutdown,
        ));

        Self { addresses, cursor }
    }

    /// Atomically replace the remote address set.
    pub fn set_new_addresses(&self, addresses: Vec<String>) {
        let mut slot = self.addresses.write().expect("proxy address lock");
        debug!(count = addresses.len(), "proxy addresses swapped");
        *slot = addresses;
    }

    /// Snapshot of the current address set.
    pub fn addresses(&self) -> Vec<String> {
        self.addresses.read().expect("proxy address lock").clone()
    }

    /// The remote the next connection would use (round-robin).
    pub fn next_address(&self) -> Option<String> {
        pick(&self.addresses, &self.cursor)
    }
}

fn pick(addresses: &RwLock<Vec<String>>, cursor: &AtomicUsize) -> Option<String> {
    let addresses = addresses.read().expect("proxy address lock");
    if addresses.is_empty() {
        return None;
    }
    let idx = cursor.fetch_add(1, Ordering::Relaxed) % addresses.len();
    Some(addresses[idx].clone())
}

async fn accept_loop(
    listener: TcpListener,
    forward: Forward,
    addresses: Arc<RwLock<Vec<String>>>,
    cursor: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                let (inbound, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "local proxy accept error");
                        return;
                    }
                };
                let Some(target) = pick(&addresses, &cursor) else {
                    // No remotes right now: reject new work, existing
                    // connections continue untouched.
                    debug!(%peer, "no remote addresses, dropping connection");
                    continue;
                };
                let forward = forward.clone();
                tokio::spawn(async move {
                    if let Err(err) = forward_conn(inbound, &target, &forward).await {
                        debug!(%peer, target, error = %err, "proxied connection ended with error");
                    }
                });
            }
        }
    }
}

async fn forward_conn(
    mut inbound: TcpStream,
    target: &str,
    forward: &Forward,
) -> ProxyResult<()> {
    match forward {
        Forward::Direct => {
            let mut outbound = TcpStream::connect(target).await?;
            tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
            Ok(())
        }
        Forward::Mux { port, tls } => {
            let (host, backend_port) = split_host_port(target)?;
            let header = MuxHeader::to_backend(host.clone(), backend_port).encode();
            let outbound = TcpStream::connect((host.as_str(), *port)).await?;
            if *tls {
                let mut outbound = tls_connect(outbound, &host).await?;
                outbound.write_all(header.as_bytes()).await?;
                tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
            } else {
                let mut outbound = outbound;
                outbound.write_all(header.as_bytes()).await?;
                tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
            }
            Ok(())
        }
    }
}

fn split_host_port(addr: &str) -> ProxyResult<(String, u16)> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        crate::ProxyError::Refresh(format!("bad remote address '{addr}'"))
    })?;
    let port = port
        .parse()
        .map_err(|_| crate::ProxyError::Refresh(format!("bad remote port in '{addr}'")))?;
    Ok((host.to_string(), port))
}

async fn tls_connect(
    stream: TcpStream,
    host: &str,
) -> ProxyResult<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| crate::ProxyError::Tls(e.to_string()))?;
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| crate::ProxyError::Tls(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_backend(reply: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = stream.write_all(reply).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn proxies_to_a_direct_backend() {
        let backend = start_backend(b"pong").await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        let proxy = LocalProxy::spawn(listener, Forward::Direct, rx);
        proxy.set_new_addresses(vec![backend.to_string()]);

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong");
    }

    #[tokio::test]
    async fn empty_address_set_rejects_new_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        let _proxy = LocalProxy::spawn(listener, Forward::Direct, rx);

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "connection should close with no data");
    }

    #[tokio::test]
    async fn round_robin_rotates_across_remotes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let proxy = LocalProxy::spawn(listener, Forward::Direct, rx);
        proxy.set_new_addresses(vec![
            "10.0.0.1:80".to_string(),
            "10.0.0.2:80".to_string(),
            "10.0.0.3:80".to_string(),
        ]);

        let picks: Vec<String> = (0..6).filter_map(|_| proxy.next_address()).collect();
        assert_eq!(picks.len(), 6);
        // Consecutive picks never repeat with three remotes in rotation.
        for pair in picks.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        // First and fourth pick coincide (full cycle).
        assert_eq!(picks[0], picks[3]);
    }

    #[tokio::test]
    async fn address_swap_affects_only_new_picks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let proxy = LocalProxy::spawn(listener, Forward::Direct, rx);

        proxy.set_new_addresses(vec!["10.0.0.1:80".to_string()]);
        assert_eq!(proxy.next_address().unwrap(), "10.0.0.1:80");

        proxy.set_new_addresses(vec!["10.0.0.9:80".to_string()]);
        assert_eq!(proxy.next_address().unwrap(), "10.0.0.9:80");

        proxy.set_new_addresses(Vec::new());
        assert!(proxy.next_address().is_none());
    }

    #[tokio::test]
    async fn mux_forwarding_sends_the_header_first() {
        // Fake "mux": capture everything the proxy sends.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mux_addr = listener.local_addr().unwrap();
        let (header_tx, header_rx) = tokio::sync::oneshot::channel::<Vec<u8>>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = stream.read(&mut buf).await.unwrap();
            buf.truncate(n);
            let _ = header_tx.send(buf);
        });

        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        let proxy = LocalProxy::spawn(
            local,
            Forward::Mux {
                port: mux_addr.port(),
                tls: false,
            },
            rx,
        );
        proxy.set_new_addresses(vec![format!("127.0.0.1:9999")]);

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client.write_all(b"payload").await.unwrap();

        let captured = tokio::time::timeout(Duration::from_secs(5), header_rx)
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&captured);
        assert!(text.starts_with("127.0.0.1:9999\n"), "got: {text}");
    }
}
