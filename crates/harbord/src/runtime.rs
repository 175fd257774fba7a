//! Process-backed container runtime.
//!
//! The real container engine is an external collaborator; this backend
//! realizes instances as supervised child processes running the service's
//! materialized startup command. Reattach across daemon restarts is not
//! possible for plain processes, so `attach` reports the instance gone
//! and the state machine starts a replacement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{info, warn};

use harbor_agent::{AgentError, AgentResult, ContainerRuntime, InstanceHandle};
use harbor_model::{ApplicationEndpoint, Service, ServiceState};

#[derive(Default)]
struct Running {
    /// State id -> process id of the live child.
    pids: HashMap<String, u32>,
}

/// Runs instances as local child processes.
#[derive(Default)]
pub struct ProcessRuntime {
    running: Arc<Mutex<Running>>,
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    async fn start(
        &self,
        svc: &Service,
        state: &mut ServiceState,
        _endpoints: &HashMap<String, Vec<ApplicationEndpoint>>,
    ) -> AgentResult<InstanceHandle> {
        if svc.startup.trim().is_empty() {
            return Err(AgentError::Runtime(format!(
                "service {} has no startup command",
                svc.id
            )));
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&svc.startup)
            .env("HARBOR_SERVICE_ID", &svc.id)
            .env("HARBOR_INSTANCE_ID", state.instance_id.to_string())
            .env("HARBOR_STATE_ID", &state.id)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Runtime(format!("spawn '{}': {e}", svc.startup)))?;

        let pid = child
            .id()
            .ok_or_else(|| AgentError::Runtime("child exited before it was tracked".to_string()))?;
        state.private_ip = state.host_ip.clone();
        let container_id = format!("proc-{pid}");
        info!(service = %svc.id, state = %state.id, pid, "process instance started");

        self.running
            .lock()
            .expect("runtime lock")
            .pids
            .insert(state.id.clone(), pid);

        let (exit_tx, done) = oneshot::channel();
        let running = Arc::clone(&self.running);
        let state_id = state.id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(err) => {
                    warn!(state = %state_id, error = %err, "wait on child failed");
                    -1
                }
            };
            running.lock().expect("runtime lock").pids.remove(&state_id);
            let _ = exit_tx.send(code);
        });

        Ok(InstanceHandle { container_id, done })
    }

    async fn attach(&self, state: &ServiceState) -> AgentResult<Option<InstanceHandle>> {
        // Child processes do not survive the daemon, so there is nothing
        // to reattach to.
        let running = self.running.lock().expect("runtime lock");
        if running.pids.contains_key(&state.id) {
            warn!(state = %state.id, "attach to a live in-process instance is unsupported");
        }
        Ok(None)
    }

    async fn stop(&self, state_id: &str, timeout: Duration) -> AgentResult<()> {
        let pid = {
            let running = self.running.lock().expect("runtime lock");
            running.pids.get(state_id).copied()
        };
        let Some(pid) = pid else {
            return Ok(());
        };

        // SIGTERM first; the reaper task clears the pid table when the
        // process exits.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self
                .running
                .lock()
                .expect("runtime lock")
                .pids
                .contains_key(state_id)
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(state = %state_id, pid, "stop timeout, escalating to SIGKILL");
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with(startup: &str) -> Service {
        let mut svc = Service::new("svc", "p1", "app");
        svc.startup = startup.to_string();
        svc
    }

    #[tokio::test]
    async fn short_lived_process_reports_its_exit_code() {
        let runtime = ProcessRuntime::new();
        let svc = service_with("exit 3");
        let mut state = ServiceState::new("ss1", "svc", "h1", 0);

        let handle = runtime
            .start(&svc, &mut state, &HashMap::new())
            .await
            .unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), handle.done)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_process() {
        let runtime = ProcessRuntime::new();
        let svc = service_with("sleep 60");
        let mut state = ServiceState::new("ss1", "svc", "h1", 0);

        let handle = runtime
            .start(&svc, &mut state, &HashMap::new())
            .await
            .unwrap();
        runtime.stop("ss1", Duration::from_secs(5)).await.unwrap();

        let code = tokio::time::timeout(Duration::from_secs(5), handle.done)
            .await
            .unwrap()
            .unwrap();
        // Terminated by signal: no normal exit code.
        assert_eq!(code, -1);
    }

    #[tokio::test]
    async fn empty_startup_is_an_error() {
        let runtime = ProcessRuntime::new();
        let svc = service_with("   ");
        let mut state = ServiceState::new("ss1", "svc", "h1", 0);
        assert!(runtime
            .start(&svc, &mut state, &HashMap::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn attach_always_reports_gone() {
        let runtime = ProcessRuntime::new();
        let state = ServiceState::new("ss1", "svc", "h1", 0);
        assert!(runtime.attach(&state).await.unwrap().is_none());
    }
}
