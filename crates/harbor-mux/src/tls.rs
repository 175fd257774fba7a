//! TLS-terminating mux variant.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::mux::{serve_connection, MuxConfig};
use crate::registry::ConnectionRegistry;
use crate::{MuxError, MuxResult};

/// A certificate chain and private key for the TLS listener.
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Load a PEM certificate chain and PEM private key from disk.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> MuxResult<Self> {
        let cert_pem = std::fs::read(cert_path)?;
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<Result<_, _>>()
                .map_err(|e| MuxError::Tls(format!("bad certificate chain: {e}")))?;
        if certs.is_empty() {
            return Err(MuxError::Tls(format!(
                "no certificates in {}",
                cert_path.display()
            )));
        }

        let key_pem = std::fs::read(key_path)?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| MuxError::Tls(format!("bad private key: {e}")))?
            .ok_or_else(|| MuxError::Tls(format!("no private key in {}", key_path.display())))?;

        Ok(Self { certs, key })
    }

    /// Mint a self-signed identity for development.
    ///
    /// Used when no chain is configured; it provides encryption with no
    /// authentication whatsoever.
    pub fn insecure_dev() -> MuxResult<Self> {
        warn!("no TLS chain configured, using built-in insecure development identity");
        let key_pair = rcgen::KeyPair::generate().map_err(|e| MuxError::Tls(e.to_string()))?;
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .map_err(|e| MuxError::Tls(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| MuxError::Tls(e.to_string()))?;
        let key = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| MuxError::Tls(e.to_string()))?;
        Ok(Self {
            certs: vec![cert.der().clone()],
            key,
        })
    }

    fn into_acceptor(self) -> MuxResult<TlsAcceptor> {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certs, self.key)
            .map_err(|e| MuxError::Tls(e.to_string()))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// The mux with TLS termination on the listener. Same wire protocol as
/// [`crate::TcpMux`] after the handshake.
pub struct TlsMux {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<ConnectionRegistry>,
    config: MuxConfig,
}

impl TlsMux {
    pub fn new(
        listener: TcpListener,
        identity: TlsIdentity,
        registry: Arc<ConnectionRegistry>,
        config: MuxConfig,
    ) -> MuxResult<Self> {
        Ok(Self {
            listener,
            acceptor: identity.into_acceptor()?,
            registry,
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept, handshake, and serve until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("tls mux accept loop shutting down");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        let acceptor = self.acceptor.clone();
                        let registry = Arc::clone(&self.registry);
                        let config = self.config.clone();
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let local = conn.local_addr().ok();
                            let tls = match acceptor.accept(conn).await {
                                Ok(tls) => tls,
                                Err(err) => {
                                    warn!(%peer, error = %err, "tls handshake failed");
                                    return;
                                }
                            };
                            if let Err(err) =
                                serve_connection(tls, peer, local, registry, config, conn_shutdown)
                                    .await
                            {
                                debug!(%peer, error = %err, "tls mux connection ended with error");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "tls mux accept error, shutting down");
                        return;
                    }
                }
            }
        }
    }
}
