//! The per-instance state machine.
//!
//! One loop per host-state node, re-armed after every event, driving
//! Idle → Starting → Running → Stopping → Terminated through the
//! container runtime. The loop tolerates observing a service state before
//! its host state (and vice versa) by simply re-arming.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use harbor_coord::{paths, Client, WatchEvent, ANY_VERSION};
use harbor_model::{DesiredState, Service, ServiceState};
use harbor_template::Evaluator;

use crate::epoch_secs;
use crate::master::MasterClient;
use crate::runtime::ContainerRuntime;
use crate::AgentResult;

/// Everything an instance loop needs, cloned per spawn.
pub(crate) struct InstanceContext {
    pub pool_id: String,
    pub host_id: String,
    pub coord: Client,
    pub master: Arc<dyn MasterClient>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub stop_timeout: Duration,
}

impl InstanceContext {
    fn host_state_path(&self, state_id: &str) -> String {
        paths::host_state_node(&self.pool_id, &self.host_id, state_id)
    }

    fn service_state_path(&self, service_id: &str, state_id: &str) -> String {
        paths::service_state_node(&self.pool_id, service_id, state_id)
    }
}

/// Run one instance to completion; reports the state id on exit.
pub(crate) async fn instance_loop(
    ctx: InstanceContext,
    state_id: String,
    done_tx: mpsc::UnboundedSender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut process_done: Option<oneshot::Receiver<i32>> = None;
    let hpath = ctx.host_state_path(&state_id);

    loop {
        let (hs, _, event) = match ctx.coord.get_json_w::<harbor_model::HostState>(&hpath) {
            Ok(triple) => triple,
            Err(err) => {
                debug!(state = %state_id, error = %err, "host state gone, ending loop");
                break;
            }
        };
        if !hs.is_complete() {
            error!(state = %state_id, "invalid host state, discarding");
            let _ = ctx.coord.delete(&hpath, ANY_VERSION);
            break;
        }

        let spath = ctx.service_state_path(&hs.service_id, &state_id);
        let (mut state, _) = match ctx.coord.get_json::<ServiceState>(&spath) {
            Ok(pair) => pair,
            Err(err) => {
                // The matching service state may not be visible yet, or is
                // gone for good; drop our half and let the scheduler
                // recreate the pair.
                warn!(state = %state_id, error = %err, "could not load service state");
                let _ = ctx.coord.delete(&hpath, ANY_VERSION);
                break;
            }
        };
        let (svc, _) = match ctx
            .coord
            .get_json::<Service>(&paths::service_node(&ctx.pool_id, &hs.service_id))
        {
            Ok(pair) => pair,
            Err(err) => {
                error!(service = %hs.service_id, error = %err, "could not load service");
                break;
            }
        };

        match hs.desired_state {
            DesiredState::Run => {
                if !state.is_running() {
                    match start_instance(&ctx, &svc, &mut state, &spath).await {
                        Ok(done) => process_done = Some(done),
                        Err(err) => {
                            error!(state = %state_id, error = %err, "could not start instance");
                            stop_and_remove(&ctx, &state_id, &hs.service_id).await;
                            break;
                        }
                    }
                } else if process_done.is_none() {
                    match ctx.runtime.attach(&state).await {
                        Ok(Some(handle)) => {
                            info!(state = %state_id, container = %handle.container_id, "reattached to running container");
                            process_done = Some(handle.done);
                        }
                        Ok(None) => {
                            // Container died while we were away: record the
                            // termination so the scheduler reschedules.
                            state.terminated = epoch_secs();
                            if let Err(err) = ctx.coord.set_json(&spath, &state, ANY_VERSION) {
                                warn!(state = %state_id, error = %err, "could not publish termination");
                            }
                            continue;
                        }
                        Err(err) => {
                            error!(state = %state_id, error = %err, "could not attach to instance");
                            stop_and_remove(&ctx, &state_id, &hs.service_id).await;
                            break;
                        }
                    }
                }
            }
            DesiredState::Stop => {
                if let Some(done) = process_done.take() {
                    detach_instance(&ctx, &state_id, &hs.service_id, done).await;
                } else {
                    stop_and_remove(&ctx, &state_id, &hs.service_id).await;
                }
                break;
            }
            DesiredState::Pause => {
                debug!(state = %state_id, "pause requested, leaving instance as-is");
            }
        }

        // Wait for the process to end, the node to change, or shutdown.
        let mut surviving: Option<oneshot::Receiver<i32>> = None;
        let outcome = if let Some(mut done) = process_done.take() {
            tokio::select! {
                exit = &mut done => Wake::ProcessEnded(exit.unwrap_or(-1)),
                ev = event => {
                    // The process is still live; keep its handle.
                    surviving = Some(done);
                    Wake::Event(ev.ok())
                }
                _ = shutdown.changed() => Wake::Shutdown(Some(done)),
            }
        } else {
            tokio::select! {
                ev = event => Wake::Event(ev.ok()),
                _ = shutdown.changed() => Wake::Shutdown(None),
            }
        };
        process_done = surviving;

        match outcome {
            Wake::ProcessEnded(exit_code) => {
                info!(state = %state_id, exit_code, "instance process ended");
                if let Ok((mut state, _)) = ctx.coord.get_json::<ServiceState>(&spath) {
                    state.terminated = epoch_secs();
                    state.exit_code = exit_code;
                    if let Err(err) = ctx.coord.set_json(&spath, &state, ANY_VERSION) {
                        warn!(state = %state_id, error = %err, "could not publish exit");
                    }
                }
                // Loop again; the scheduler observes the update and
                // decides whether to reschedule.
            }
            Wake::Event(Some(WatchEvent::Deleted(_))) => {
                debug!(state = %state_id, "host state deleted, ending loop");
                break;
            }
            Wake::Event(Some(WatchEvent::Expired)) | Wake::Event(None) => {
                warn!(state = %state_id, "watch invalidated, ending loop");
                break;
            }
            Wake::Event(Some(_)) => {
                // Desired state may have changed; re-arm and re-evaluate.
            }
            Wake::Shutdown(done) => {
                info!(state = %state_id, "shutting down instance");
                match done {
                    Some(done) => detach_instance(&ctx, &state_id, &hs.service_id, done).await,
                    None => stop_and_remove(&ctx, &state_id, &hs.service_id).await,
                }
                break;
            }
        }
    }

    let _ = done_tx.send(state_id);
}

enum Wake {
    ProcessEnded(i32),
    Event(Option<WatchEvent>),
    Shutdown(Option<oneshot::Receiver<i32>>),
}

/// Start a fresh container: resolve imports, re-evaluate templates with
/// dispatch-time context, launch, publish the updated state.
async fn start_instance(
    ctx: &InstanceContext,
    svc: &Service,
    state: &mut ServiceState,
    spath: &str,
) -> AgentResult<oneshot::Receiver<i32>> {
    // Imported endpoints, resolved against live exporters.
    let endpoints = ctx
        .master
        .service_endpoints(&svc.id)
        .await
        .unwrap_or_else(|err| {
            warn!(service = %svc.id, error = %err, "endpoint resolution failed, starting without imports");
            Default::default()
        });

    // Dispatch-time template pass: the instance's addresses are known now.
    let mut materialized = svc.clone();
    let pool_id = ctx.pool_id.clone();
    let coord = ctx.coord.clone();
    let evaluator = Evaluator::new(move |id: &str| {
        coord
            .get_json::<Service>(&paths::service_node(&pool_id, id))
            .ok()
            .map(|(svc, _)| svc)
    });
    evaluator.evaluate_service(&mut materialized);

    let handle = ctx.runtime.start(&materialized, state, &endpoints).await?;
    state.started = epoch_secs();
    state.container_id = handle.container_id.clone();
    ctx.coord.set_json(spath, state, ANY_VERSION)?;
    info!(
        service = %svc.id,
        state = %state.id,
        instance = state.instance_id,
        container = %handle.container_id,
        "instance started"
    );
    Ok(handle.done)
}

/// Stop a live instance and wait for its process before cleaning up.
async fn detach_instance(
    ctx: &InstanceContext,
    state_id: &str,
    service_id: &str,
    done: oneshot::Receiver<i32>,
) {
    if let Err(err) = ctx.runtime.stop(state_id, ctx.stop_timeout).await {
        warn!(state = %state_id, error = %err, "could not stop instance");
    }
    let _ = done.await;
    remove_instance(ctx, state_id, service_id);
}

/// Stop (best effort) and clean up without a live process handle.
async fn stop_and_remove(ctx: &InstanceContext, state_id: &str, service_id: &str) {
    if let Err(err) = ctx.runtime.stop(state_id, ctx.stop_timeout).await {
        debug!(state = %state_id, error = %err, "stop without live process");
    }
    remove_instance(ctx, state_id, service_id);
}

/// Delete this instance's host-state and service-state nodes.
fn remove_instance(ctx: &InstanceContext, state_id: &str, service_id: &str) {
    let hpath = ctx.host_state_path(state_id);
    if let Err(err) = ctx.coord.delete(&hpath, ANY_VERSION) {
        debug!(path = %hpath, error = %err, "host state already gone");
    }
    let spath = ctx.service_state_path(service_id, state_id);
    if let Err(err) = ctx.coord.delete(&spath, ANY_VERSION) {
        debug!(path = %spath, error = %err, "service state already gone");
    }
    info!(state = %state_id, "instance retired");
}
