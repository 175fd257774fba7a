//! The in-process coordinator and its session-scoped client handles.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{CoordError, CoordResult};

/// Sentinel accepted by `set`/`delete` to skip the version check.
pub const ANY_VERSION: u64 = u64::MAX;

/// A single watch notification. Watches fire exactly once; re-arm by
/// calling the watching operation again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(String),
    DataChanged(String),
    Deleted(String),
    ChildrenChanged(String),
    /// The watching session is gone; every state read so far is suspect.
    Expired,
}

/// Receiver half of an armed watch.
pub type WatchRx = oneshot::Receiver<WatchEvent>;

#[derive(Default)]
struct NodeEntry {
    data: Vec<u8>,
    version: u64,
    ephemeral_owner: Option<u64>,
}

struct WatchReg {
    session: u64,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct PathWatches {
    data: Vec<WatchReg>,
    exists: Vec<WatchReg>,
    children: Vec<WatchReg>,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, NodeEntry>,
    watches: HashMap<String, PathWatches>,
    sessions: HashMap<u64, HashSet<String>>,
    next_session: u64,
}

/// The in-process coordination store.
///
/// Cheap to clone; all clones share one namespace.
#[derive(Clone)]
pub struct Coordinator {
    state: Arc<Mutex<State>>,
    session_timeout: Duration,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            session_timeout: Duration::from_secs(15),
        }
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Open a new session and return its client handle.
    pub fn connect(&self) -> Client {
        let mut state = self.state.lock().expect("coord lock");
        state.next_session += 1;
        let session = state.next_session;
        state.sessions.insert(session, HashSet::new());
        debug!(session, "coordination session opened");
        Client {
            coord: self.clone(),
            session,
        }
    }
}

/// A session-scoped handle onto the coordination namespace.
///
/// Clones share the session; ephemerals created through any clone die with
/// it.
#[derive(Clone)]
pub struct Client {
    coord: Coordinator,
    session: u64,
}

impl Client {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.coord.state.lock().expect("coord lock")
    }

    fn check_session(state: &State, session: u64) -> CoordResult<()> {
        if state.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(CoordError::SessionExpired)
        }
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Create a persistent node. The parent must already exist.
    pub fn create(&self, path: &str, data: &[u8]) -> CoordResult<()> {
        self.create_node(path, data, false)
    }

    /// Create an ephemeral node owned by this session.
    pub fn create_ephemeral(&self, path: &str, data: &[u8]) -> CoordResult<()> {
        self.create_node(path, data, true)
    }

    /// Create a JSON-encoded persistent node.
    pub fn create_json<T: Serialize>(&self, path: &str, value: &T) -> CoordResult<()> {
        let bytes = serde_json::to_vec(value).map_err(CoordError::Encode)?;
        self.create(path, &bytes)
    }

    /// Create a JSON-encoded ephemeral node.
    pub fn create_ephemeral_json<T: Serialize>(&self, path: &str, value: &T) -> CoordResult<()> {
        let bytes = serde_json::to_vec(value).map_err(CoordError::Encode)?;
        self.create_ephemeral(path, &bytes)
    }

    fn create_node(&self, path: &str, data: &[u8], ephemeral: bool) -> CoordResult<()> {
        let path = normalize(path)?;
        let mut state = self.lock();
        Self::check_session(&state, self.session)?;
        if state.nodes.contains_key(&path) {
            return Err(CoordError::AlreadyExists(path));
        }
        if let Some(parent) = parent_of(&path) {
            if !state.nodes.contains_key(parent) {
                return Err(CoordError::NoParent(path.clone()));
            }
        }
        state.nodes.insert(
            path.clone(),
            NodeEntry {
                data: data.to_vec(),
                version: 1,
                ephemeral_owner: ephemeral.then_some(self.session),
            },
        );
        if ephemeral {
            if let Some(owned) = state.sessions.get_mut(&self.session) {
                owned.insert(path.clone());
            }
        }
        fire_created(&mut state, &path);
        Ok(())
    }

    /// Create every missing component of `path` as a persistent node with
    /// empty data. Existing components are left alone.
    pub fn ensure_path(&self, path: &str) -> CoordResult<()> {
        let path = normalize(path)?;
        let mut state = self.lock();
        Self::check_session(&state, self.session)?;
        let mut prefix = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            prefix.push('/');
            prefix.push_str(part);
            if !state.nodes.contains_key(&prefix) {
                state.nodes.insert(
                    prefix.clone(),
                    NodeEntry {
                        version: 1,
                        ..NodeEntry::default()
                    },
                );
                fire_created(&mut state, &prefix);
            }
        }
        Ok(())
    }

    /// Replace a node's payload, enforcing the version unless
    /// [`ANY_VERSION`] is passed. Returns the new version.
    pub fn set(&self, path: &str, data: &[u8], version: u64) -> CoordResult<u64> {
        let path = normalize(path)?;
        let mut state = self.lock();
        Self::check_session(&state, self.session)?;
        let entry = state
            .nodes
            .get_mut(&path)
            .ok_or_else(|| CoordError::NotFound(path.clone()))?;
        if version != ANY_VERSION && entry.version != version {
            return Err(CoordError::BadVersion {
                path,
                expected: version,
                found: entry.version,
            });
        }
        entry.data = data.to_vec();
        entry.version += 1;
        let new_version = entry.version;
        fire_data_changed(&mut state, &path);
        Ok(new_version)
    }

    /// JSON-encode and [`set`](Self::set).
    pub fn set_json<T: Serialize>(&self, path: &str, value: &T, version: u64) -> CoordResult<u64> {
        let bytes = serde_json::to_vec(value).map_err(CoordError::Encode)?;
        self.set(path, &bytes, version)
    }

    /// Delete a leaf node, enforcing the version unless [`ANY_VERSION`].
    pub fn delete(&self, path: &str, version: u64) -> CoordResult<()> {
        let path = normalize(path)?;
        let mut state = self.lock();
        Self::check_session(&state, self.session)?;
        let entry = state
            .nodes
            .get(&path)
            .ok_or_else(|| CoordError::NotFound(path.clone()))?;
        if version != ANY_VERSION && entry.version != version {
            return Err(CoordError::BadVersion {
                path,
                expected: version,
                found: entry.version,
            });
        }
        if has_children(&state, &path) {
            return Err(CoordError::NotEmpty(path));
        }
        remove_node(&mut state, &path);
        Ok(())
    }

    /// Delete a node and everything beneath it, deepest first.
    pub fn delete_recursive(&self, path: &str) -> CoordResult<()> {
        let path = normalize(path)?;
        let mut state = self.lock();
        Self::check_session(&state, self.session)?;
        if !state.nodes.contains_key(&path) {
            return Err(CoordError::NotFound(path));
        }
        let mut doomed: Vec<String> = state
            .nodes
            .keys()
            .filter(|k| is_descendant(k, &path))
            .cloned()
            .collect();
        doomed.push(path);
        doomed.sort_by(|a, b| b.len().cmp(&a.len()));
        for node in doomed {
            remove_node(&mut state, &node);
        }
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Read a node's payload and version.
    pub fn get(&self, path: &str) -> CoordResult<(Vec<u8>, u64)> {
        let path = normalize(path)?;
        let state = self.lock();
        let entry = state
            .nodes
            .get(&path)
            .ok_or_else(|| CoordError::NotFound(path))?;
        Ok((entry.data.clone(), entry.version))
    }

    /// Read and JSON-decode a node.
    pub fn get_json<T: DeserializeOwned>(&self, path: &str) -> CoordResult<(T, u64)> {
        let (bytes, version) = self.get(path)?;
        let value = serde_json::from_slice(&bytes).map_err(|e| CoordError::Decode {
            path: path.to_string(),
            source: e,
        })?;
        Ok((value, version))
    }

    /// Whether a node exists.
    pub fn exists(&self, path: &str) -> CoordResult<bool> {
        let path = normalize(path)?;
        Ok(self.lock().nodes.contains_key(&path))
    }

    /// Sorted names of a node's direct children.
    pub fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        let path = normalize(path)?;
        let state = self.lock();
        if !state.nodes.contains_key(&path) {
            return Err(CoordError::NotFound(path));
        }
        Ok(child_names(&state, &path))
    }

    // ── Watches ────────────────────────────────────────────────────

    /// Children plus a one-shot watch firing on the next membership
    /// change (or node deletion, or session expiry).
    pub fn children_w(&self, path: &str) -> CoordResult<(Vec<String>, WatchRx)> {
        let path = normalize(path)?;
        let mut state = self.lock();
        Self::check_session(&state, self.session)?;
        if !state.nodes.contains_key(&path) {
            return Err(CoordError::NotFound(path));
        }
        let names = child_names(&state, &path);
        let (tx, rx) = oneshot::channel();
        state.watches.entry(path).or_default().children.push(WatchReg {
            session: self.session,
            tx,
        });
        Ok((names, rx))
    }

    /// Payload + version plus a one-shot watch firing on the next data
    /// change or deletion.
    pub fn get_w(&self, path: &str) -> CoordResult<(Vec<u8>, u64, WatchRx)> {
        let path = normalize(path)?;
        let mut state = self.lock();
        Self::check_session(&state, self.session)?;
        let entry = state
            .nodes
            .get(&path)
            .ok_or_else(|| CoordError::NotFound(path.clone()))?;
        let (data, version) = (entry.data.clone(), entry.version);
        let (tx, rx) = oneshot::channel();
        state.watches.entry(path).or_default().data.push(WatchReg {
            session: self.session,
            tx,
        });
        Ok((data, version, rx))
    }

    /// JSON-decoding [`get_w`](Self::get_w).
    pub fn get_json_w<T: DeserializeOwned>(&self, path: &str) -> CoordResult<(T, u64, WatchRx)> {
        let (bytes, version, rx) = self.get_w(path)?;
        let value = serde_json::from_slice(&bytes).map_err(|e| CoordError::Decode {
            path: path.to_string(),
            source: e,
        })?;
        Ok((value, version, rx))
    }

    /// Existence plus a one-shot watch firing on the next create, data
    /// change, or delete of the path.
    pub fn exists_w(&self, path: &str) -> CoordResult<(bool, WatchRx)> {
        let path = normalize(path)?;
        let mut state = self.lock();
        Self::check_session(&state, self.session)?;
        let exists = state.nodes.contains_key(&path);
        let (tx, rx) = oneshot::channel();
        state.watches.entry(path).or_default().exists.push(WatchReg {
            session: self.session,
            tx,
        });
        Ok((exists, rx))
    }

    // ── Session control ────────────────────────────────────────────

    /// Tear down this session: every watch the session armed fires
    /// [`WatchEvent::Expired`], then its ephemerals are removed (which
    /// notifies the surviving sessions' watches).
    pub fn expire_session(&self) {
        let mut state = self.lock();
        let Some(owned) = state.sessions.remove(&self.session) else {
            return;
        };
        debug!(session = self.session, ephemerals = owned.len(), "session expired");

        // Invalidate this session's watches first so it observes Expired,
        // not the fallout of its own ephemerals disappearing.
        let session = self.session;
        for watches in state.watches.values_mut() {
            for list in [&mut watches.data, &mut watches.exists, &mut watches.children] {
                let mut kept = Vec::new();
                for reg in list.drain(..) {
                    if reg.session == session {
                        let _ = reg.tx.send(WatchEvent::Expired);
                    } else {
                        kept.push(reg);
                    }
                }
                *list = kept;
            }
        }

        let mut owned: Vec<String> = owned.into_iter().collect();
        owned.sort_by(|a, b| b.len().cmp(&a.len()));
        for path in owned {
            if state.nodes.contains_key(&path) {
                remove_node(&mut state, &path);
            }
        }
    }
}

// ── Internal helpers ──────────────────────────────────────────────

fn normalize(path: &str) -> CoordResult<String> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
        return Err(CoordError::NotFound(format!("malformed path '{path}'")));
    }
    Ok(path.to_string())
}

fn parent_of(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        None
    } else {
        Some(&path[..idx])
    }
}

fn is_descendant(candidate: &str, root: &str) -> bool {
    candidate.len() > root.len() + 1 && candidate.starts_with(root) && candidate.as_bytes()[root.len()] == b'/'
}

fn has_children(state: &State, path: &str) -> bool {
    state.nodes.keys().any(|k| is_descendant(k, path) && direct_child(k, path))
}

fn direct_child(candidate: &str, root: &str) -> bool {
    !candidate[root.len() + 1..].contains('/')
}

fn child_names(state: &State, path: &str) -> Vec<String> {
    state
        .nodes
        .keys()
        .filter(|k| is_descendant(k, path) && direct_child(k, path))
        .map(|k| k[path.len() + 1..].to_string())
        .collect()
}

fn take_watches(state: &mut State, path: &str) -> PathWatches {
    state.watches.remove(path).unwrap_or_default()
}

fn fire_created(state: &mut State, path: &str) {
    let mut watches = take_watches(state, path);
    for reg in watches.exists.drain(..) {
        let _ = reg.tx.send(WatchEvent::Created(path.to_string()));
    }
    // Data and child watches on the path survive a create of the same path
    // (they could only have been armed while it existed before).
    state.watches.insert(path.to_string(), watches);
    fire_children_changed(state, path);
}

fn fire_data_changed(state: &mut State, path: &str) {
    let mut watches = take_watches(state, path);
    for reg in watches.data.drain(..) {
        let _ = reg.tx.send(WatchEvent::DataChanged(path.to_string()));
    }
    for reg in watches.exists.drain(..) {
        let _ = reg.tx.send(WatchEvent::DataChanged(path.to_string()));
    }
    state.watches.insert(path.to_string(), watches);
}

fn fire_children_changed(state: &mut State, path: &str) {
    let Some(parent) = parent_of(path) else {
        return;
    };
    let parent = parent.to_string();
    let mut watches = take_watches(state, &parent);
    for reg in watches.children.drain(..) {
        let _ = reg.tx.send(WatchEvent::ChildrenChanged(parent.clone()));
    }
    state.watches.insert(parent, watches);
}

fn remove_node(state: &mut State, path: &str) {
    let Some(entry) = state.nodes.remove(path) else {
        return;
    };
    if let Some(owner) = entry.ephemeral_owner {
        if let Some(owned) = state.sessions.get_mut(&owner) {
            owned.remove(path);
        }
    }
    let mut watches = take_watches(state, path);
    for reg in watches
        .data
        .drain(..)
        .chain(watches.exists.drain(..))
        .chain(watches.children.drain(..))
    {
        let _ = reg.tx.send(WatchEvent::Deleted(path.to_string()));
    }
    fire_children_changed(state, path);
}
