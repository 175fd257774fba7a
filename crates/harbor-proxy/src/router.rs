//! The per-instance proxy router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use harbor_model::ApplicationEndpoint;

use crate::local::{Forward, LocalProxy};
use crate::vif::VifRegistry;
use crate::ProxyResult;

/// Where the router fetches `{endpoint key -> remote endpoints}` from;
/// in production, the master RPC.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    async fn service_endpoints(
        &self,
        service_id: &str,
    ) -> ProxyResult<HashMap<String, Vec<ApplicationEndpoint>>>;
}

/// Maintains one [`LocalProxy`] per imported endpoint key for a service
/// instance, refreshing remote address sets on a fixed cadence.
pub struct ProxyRouter {
    service_id: String,
    source: Arc<dyn EndpointSource>,
    forward: Forward,
    vifs: Arc<VifRegistry>,
    refresh_interval: Duration,
    proxies: HashMap<String, LocalProxy>,
}

impl ProxyRouter {
    pub fn new(
        service_id: impl Into<String>,
        source: Arc<dyn EndpointSource>,
        forward: Forward,
        vifs: Arc<VifRegistry>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            source,
            forward,
            vifs,
            refresh_interval: Duration::from_secs(10),
            proxies: HashMap::new(),
        }
    }

    /// Override the refresh cadence (tests).
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Endpoint keys with an active local listener.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.proxies.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The proxy for one endpoint key.
    pub fn proxy(&self, key: &str) -> Option<&LocalProxy> {
        self.proxies.get(key)
    }

    /// Refresh immediately, then on every tick until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.refresh(&shutdown).await;
            tokio::select! {
                _ = tokio::time::sleep(self.refresh_interval) => {}
                _ = shutdown.changed() => {
                    debug!(service = %self.service_id, "proxy router shutting down");
                    return;
                }
            }
        }
    }

    /// One refresh pass: fetch, then reconcile listeners and address sets.
    pub async fn refresh(&mut self, shutdown: &watch::Receiver<bool>) {
        let endpoints = match self.source.service_endpoints(&self.service_id).await {
            Ok(endpoints) => endpoints,
            Err(err) => {
                warn!(service = %self.service_id, error = %err, "endpoint refresh failed");
                return;
            }
        };

        for (key, remotes) in endpoints {
            if remotes.is_empty() {
                // No live exporters: starve the proxy but keep it (and its
                // established connections) alive.
                if let Some(proxy) = self.proxies.get(&key) {
                    warn!(%key, "no endpoints found, clearing addresses");
                    proxy.set_new_addresses(Vec::new());
                }
                continue;
            }

            let mut addresses: Vec<String> = remotes.iter().map(|ep| ep.host_addr()).collect();
            addresses.sort();

            if !self.proxies.contains_key(&key) {
                let container_port = remotes[0].container_port;
                let listener = match TcpListener::bind(("0.0.0.0", container_port)).await {
                    Ok(listener) => listener,
                    Err(err) => {
                        // Port still owned by someone else; try again next
                        // tick.
                        warn!(%key, container_port, error = %err, "could not bind proxy port");
                        continue;
                    }
                };
                info!(%key, container_port, "proxy listener started");
                let proxy = LocalProxy::spawn(listener, self.forward.clone(), shutdown.clone());
                self.proxies.insert(key.clone(), proxy);

                let first = &remotes[0];
                if !first.virtual_address.is_empty() {
                    if let Err(err) = self.vifs.register_virtual_address(
                        &first.virtual_address,
                        first.container_port,
                        first.protocol,
                    ) {
                        warn!(
                            virtual_address = %first.virtual_address,
                            error = %err,
                            "could not register virtual address"
                        );
                    }
                }
            }

            if let Some(proxy) = self.proxies.get(&key) {
                proxy.set_new_addresses(addresses);
            }
        }
    }
}
