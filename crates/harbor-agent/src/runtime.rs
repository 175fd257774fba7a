//! The container runtime seam.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use harbor_model::{ApplicationEndpoint, Service, ServiceState};

use crate::{AgentError, AgentResult};

/// A launched (or reattached) container instance.
pub struct InstanceHandle {
    /// Runtime identifier of the container.
    pub container_id: String,
    /// Resolves with the exit code when the process ends.
    pub done: oneshot::Receiver<i32>,
}

/// What the agent needs from a container runtime.
///
/// The real backend launches containers tagged with the service-state id;
/// `attach` rediscovers them after an agent restart. `stop` sends SIGTERM
/// and escalates to SIGKILL after the timeout.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch a new container for the instance. The service arrives with
    /// templates already materialized; `endpoints` carries the resolved
    /// imports. Fills runtime facts (private IP, port mappings) into
    /// `state`.
    async fn start(
        &self,
        svc: &Service,
        state: &mut ServiceState,
        endpoints: &HashMap<String, Vec<ApplicationEndpoint>>,
    ) -> AgentResult<InstanceHandle>;

    /// Reattach to a container tagged with the state id, if one is still
    /// running.
    async fn attach(&self, state: &ServiceState) -> AgentResult<Option<InstanceHandle>>;

    /// Stop the instance's container: SIGTERM, then SIGKILL after
    /// `timeout`.
    async fn stop(&self, state_id: &str, timeout: Duration) -> AgentResult<()>;
}

// ── Mock runtime ─────────────────────────────────────────────────────

struct MockInstance {
    container_id: String,
    exit_tx: Option<oneshot::Sender<i32>>,
}

/// An in-memory runtime for tests: tracks which state ids are "running"
/// and lets the test end them with an exit code.
#[derive(Default)]
pub struct MockRuntime {
    instances: Mutex<HashMap<String, MockInstance>>,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// State ids started so far, in order.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// State ids stopped so far, in order.
    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn running_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// End a running instance as if its process exited.
    pub fn finish(&self, state_id: &str, exit_code: i32) {
        let mut instances = self.instances.lock().unwrap();
        if let Some(mut instance) = instances.remove(state_id) {
            if let Some(tx) = instance.exit_tx.take() {
                let _ = tx.send(exit_code);
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn start(
        &self,
        _svc: &Service,
        state: &mut ServiceState,
        _endpoints: &HashMap<String, Vec<ApplicationEndpoint>>,
    ) -> AgentResult<InstanceHandle> {
        let container_id = format!("mock-{}", state.id);
        let (exit_tx, done) = oneshot::channel();
        self.instances.lock().unwrap().insert(
            state.id.clone(),
            MockInstance {
                container_id: container_id.clone(),
                exit_tx: Some(exit_tx),
            },
        );
        self.started.lock().unwrap().push(state.id.clone());
        state.private_ip = "172.17.0.2".to_string();
        debug!(state = %state.id, "mock container started");
        Ok(InstanceHandle { container_id, done })
    }

    async fn attach(&self, state: &ServiceState) -> AgentResult<Option<InstanceHandle>> {
        let mut instances = self.instances.lock().unwrap();
        match instances.get_mut(&state.id) {
            Some(instance) => {
                // Hand the caller a fresh done channel for the running
                // container.
                let (exit_tx, done) = oneshot::channel();
                instance.exit_tx = Some(exit_tx);
                Ok(Some(InstanceHandle {
                    container_id: instance.container_id.clone(),
                    done,
                }))
            }
            None => Ok(None),
        }
    }

    async fn stop(&self, state_id: &str, _timeout: Duration) -> AgentResult<()> {
        self.stopped.lock().unwrap().push(state_id.to_string());
        let mut instances = self.instances.lock().unwrap();
        if let Some(mut instance) = instances.remove(state_id) {
            if let Some(tx) = instance.exit_tx.take() {
                let _ = tx.send(143); // SIGTERM exit status
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRuntime")
            .field("running", &self.running_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_finish_cycle() {
        let runtime = MockRuntime::new();
        let svc = Service::new("svc", "p1", "app");
        let mut state = ServiceState::new("ss1", "svc", "h1", 0);

        let handle = runtime
            .start(&svc, &mut state, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(runtime.running_count(), 1);
        assert!(!state.private_ip.is_empty());

        runtime.finish("ss1", 0);
        assert_eq!(handle.done.await.unwrap(), 0);
        assert_eq!(runtime.running_count(), 0);
    }

    #[tokio::test]
    async fn attach_finds_only_running_instances() {
        let runtime = MockRuntime::new();
        let svc = Service::new("svc", "p1", "app");
        let mut state = ServiceState::new("ss1", "svc", "h1", 0);
        runtime
            .start(&svc, &mut state, &HashMap::new())
            .await
            .unwrap();

        assert!(runtime.attach(&state).await.unwrap().is_some());

        let ghost = ServiceState::new("ss2", "svc", "h1", 1);
        assert!(runtime.attach(&ghost).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_reports_sigterm_exit() {
        let runtime = MockRuntime::new();
        let svc = Service::new("svc", "p1", "app");
        let mut state = ServiceState::new("ss1", "svc", "h1", 0);
        let handle = runtime
            .start(&svc, &mut state, &HashMap::new())
            .await
            .unwrap();

        runtime.stop("ss1", Duration::from_secs(30)).await.unwrap();
        assert_eq!(runtime.stopped(), vec!["ss1"]);
        assert_eq!(handle.done.await.unwrap(), 143);
    }
}
