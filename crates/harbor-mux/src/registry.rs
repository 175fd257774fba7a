//! Connection accounting for the mux.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use harbor_model::{ApplicationEndpoint, MuxSource};
use tracing::debug;

/// One accounted mux connection (or bundle of connections sharing a key).
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub agent_host_ip: String,
    pub agent_host_id: String,
    pub src: MuxSource,
    pub src_remote_addr: String,
    pub src_local_addr: String,
    pub dst_local_addr: String,
    pub dst_remote_addr: String,
    pub dst_name: String,
    pub endpoint: Option<ApplicationEndpoint>,
    pub active_writers: u32,
    pub created_at: SystemTime,
}

impl ConnectionInfo {
    /// The accounting key: agent + destination on the left, source on the
    /// right, column-aligned for human eyes.
    pub fn key(&self) -> String {
        format!(
            "{:<15} {:<21} <-- {:<15} {:<21}",
            self.agent_host_ip, self.dst_remote_addr, self.src.agent_host_ip, self.src_remote_addr
        )
    }
}

/// Registry of live mux connections, injected into the mux rather than
/// held as process-global state.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<String, ConnectionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection; an existing key keeps its original
    /// `created_at` and gains a writer.
    pub fn register(&self, mut info: ConnectionInfo) -> String {
        let key = info.key();
        let mut map = self.inner.write().expect("connection registry lock");
        if let Some(existing) = map.get(&key) {
            info.created_at = existing.created_at;
            info.active_writers += existing.active_writers;
        }
        debug!(%key, writers = info.active_writers, total = map.len() + 1, "mux connection registered");
        map.insert(key.clone(), info);
        key
    }

    /// Drop one writer from a key; the entry disappears when none remain.
    pub fn release(&self, key: &str) {
        let mut map = self.inner.write().expect("connection registry lock");
        if let Some(info) = map.get_mut(key) {
            info.active_writers = info.active_writers.saturating_sub(1);
            if info.active_writers == 0 {
                map.remove(key);
                debug!(%key, "mux connection released");
            }
        }
    }

    /// Copy of the current accounting table.
    pub fn snapshot(&self) -> HashMap<String, ConnectionInfo> {
        self.inner
            .read()
            .expect("connection registry lock")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("connection registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
