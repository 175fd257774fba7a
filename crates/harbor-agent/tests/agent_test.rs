//! Host agent lifecycle against the in-process coordinator and a mock
//! runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use harbor_agent::{AgentConfig, AgentResult, ContainerRuntime, HostAgent, MasterClient, MockRuntime};
use harbor_coord::{paths, Client, Coordinator, ANY_VERSION};
use harbor_model::{
    ApplicationEndpoint, DesiredState, Host, HostState, Service, ServiceState,
};

const POOL: &str = "p1";
const HOST: &str = "h1";

struct FakeMaster {
    host: Host,
}

#[async_trait]
impl MasterClient for FakeMaster {
    async fn get_host(&self, host_id: &str) -> AgentResult<Option<Host>> {
        Ok((host_id == self.host.id).then(|| self.host.clone()))
    }

    async fn update_host(&self, _host: &Host) -> AgentResult<()> {
        Ok(())
    }

    async fn service_endpoints(
        &self,
        _service_id: &str,
    ) -> AgentResult<HashMap<String, Vec<ApplicationEndpoint>>> {
        Ok(HashMap::new())
    }
}

struct Harness {
    client: Client,
    runtime: Arc<MockRuntime>,
    shutdown_tx: watch::Sender<bool>,
    agent: tokio::task::JoinHandle<AgentResult<()>>,
}

async fn start_agent(coord: &Coordinator) -> Harness {
    let client = coord.connect();
    // Storage must be ready before the agent accepts work.
    client.ensure_path(&paths::storage_leader()).unwrap();

    let master = Arc::new(FakeMaster {
        host: Host::new(HOST, POOL, "10.0.0.1"),
    });
    let runtime = Arc::new(MockRuntime::new());
    let mut config = AgentConfig::new(HOST, "10.0.0.1");
    config.poll_interval = Duration::from_millis(50);

    let agent = HostAgent::new(
        config,
        master,
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        coord.connect(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(agent.run(shutdown_rx));

    // Wait for registration + presence.
    wait_until(|| {
        client
            .exists(&paths::host_presence_node(POOL, HOST))
            .unwrap_or(false)
    })
    .await;

    Harness {
        client,
        runtime,
        shutdown_tx,
        agent: handle,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Publish a service and schedule one instance on the host, the way the
/// scheduler would.
fn schedule_instance(client: &Client, service_id: &str, state_id: &str) {
    let mut svc = Service::new(service_id, POOL, service_id);
    svc.desired_state = DesiredState::Run;
    svc.startup = "run-app".to_string();
    client.ensure_path(&paths::services_dir(POOL)).unwrap();
    let node = paths::service_node(POOL, service_id);
    if client.create_json(&node, &svc).is_err() {
        client.set_json(&node, &svc, ANY_VERSION).unwrap();
    }

    let mut state = ServiceState::new(state_id, service_id, HOST, 0);
    state.host_ip = "10.0.0.1".to_string();
    client
        .create_json(&paths::service_state_node(POOL, service_id, state_id), &state)
        .unwrap();
    client
        .create_json(
            &paths::host_state_node(POOL, HOST, state_id),
            &HostState::for_state(&state),
        )
        .unwrap();
}

#[tokio::test]
async fn registers_host_and_presence() {
    let coord = Coordinator::new();
    let harness = start_agent(&coord).await;

    let (host, _) = harness
        .client
        .get_json::<Host>(&paths::host_node(POOL, HOST))
        .unwrap();
    assert_eq!(host.id, HOST);
    assert_eq!(host.pool_id, POOL);

    harness.shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), harness.agent).await;
}

#[tokio::test]
async fn starts_scheduled_instance_and_publishes_state() {
    let coord = Coordinator::new();
    let harness = start_agent(&coord).await;

    schedule_instance(&harness.client, "svc", "ss1");
    let runtime = Arc::clone(&harness.runtime);
    wait_until(move || runtime.started().contains(&"ss1".to_string())).await;

    // The agent published the start into the service state.
    let spath = paths::service_state_node(POOL, "svc", "ss1");
    wait_until(|| {
        harness
            .client
            .get_json::<ServiceState>(&spath)
            .map(|(s, _)| s.started > 0 && !s.container_id.is_empty())
            .unwrap_or(false)
    })
    .await;

    harness.shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), harness.agent).await;
}

#[tokio::test]
async fn stop_desired_state_stops_and_retires_the_instance() {
    let coord = Coordinator::new();
    let harness = start_agent(&coord).await;

    schedule_instance(&harness.client, "svc", "ss1");
    let runtime = Arc::clone(&harness.runtime);
    wait_until(move || runtime.started().contains(&"ss1".to_string())).await;

    // Flip the desired state the way the scheduler does on scale-down.
    let hpath = paths::host_state_node(POOL, HOST, "ss1");
    let (mut hs, version) = harness.client.get_json::<HostState>(&hpath).unwrap();
    hs.desired_state = DesiredState::Stop;
    harness.client.set_json(&hpath, &hs, version).unwrap();

    // The agent stops the container and deletes both nodes.
    let runtime = Arc::clone(&harness.runtime);
    wait_until(move || runtime.stopped().contains(&"ss1".to_string())).await;
    wait_until(|| !harness.client.exists(&hpath).unwrap_or(true)).await;
    wait_until(|| {
        !harness
            .client
            .exists(&paths::service_state_node(POOL, "svc", "ss1"))
            .unwrap_or(true)
    })
    .await;

    harness.shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), harness.agent).await;
}

#[tokio::test]
async fn container_exit_restarts_under_run_desired_state() {
    let coord = Coordinator::new();
    let harness = start_agent(&coord).await;

    schedule_instance(&harness.client, "svc", "ss1");
    let runtime = Arc::clone(&harness.runtime);
    wait_until(move || !runtime.started().is_empty()).await;

    // Kill the container; desired state is still Run, so the loop starts
    // a replacement process for the same instance.
    harness.runtime.finish("ss1", 7);
    let runtime = Arc::clone(&harness.runtime);
    wait_until(move || runtime.started().len() >= 2).await;

    harness.shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), harness.agent).await;
}

#[tokio::test]
async fn shutdown_withdraws_presence_and_stops_instances() {
    let coord = Coordinator::new();
    let harness = start_agent(&coord).await;

    schedule_instance(&harness.client, "svc", "ss1");
    let runtime = Arc::clone(&harness.runtime);
    wait_until(move || runtime.started().contains(&"ss1".to_string())).await;

    harness.shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), harness.agent)
        .await
        .expect("agent should stop within the teardown window")
        .unwrap();
    assert!(result.is_ok());

    assert!(!harness
        .client
        .exists(&paths::host_presence_node(POOL, HOST))
        .unwrap());
    assert!(harness.runtime.stopped().contains(&"ss1".to_string()));
}
