//! The master-side RPC server.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use harbor_facade::Facade;
use harbor_model::{AssignmentRequest, ErrorKind, Host, Service, User};

use crate::protocol::{read_frame, write_frame, Request, Response};

#[derive(Deserialize)]
struct RemoveServiceParams {
    service_id: String,
    #[serde(default)]
    remove_assignments: bool,
}

#[derive(Deserialize)]
struct HealthCheckParams {
    #[serde(default)]
    component: String,
    #[serde(default)]
    status: String,
}

/// Serves the `ControlPlane.*` method surface over length-prefixed JSON.
pub struct RpcServer {
    facade: Arc<Facade>,
}

impl RpcServer {
    pub fn new(facade: Arc<Facade>) -> Self {
        Self { facade }
    }

    /// Accept and serve connections until shutdown.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "rpc server listening");
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("rpc server shutting down");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        debug!(%peer, "rpc connection accepted");
                        let facade = Arc::clone(&self.facade);
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(serve_connection(conn, facade, conn_shutdown));
                    }
                    Err(err) => {
                        warn!(error = %err, "rpc accept error");
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    mut conn: TcpStream,
    facade: Arc<Facade>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request: Option<Request> = tokio::select! {
            frame = read_frame(&mut conn) => match frame {
                Ok(request) => request,
                Err(err) => {
                    debug!(error = %err, "rpc read failed, closing connection");
                    return;
                }
            },
            _ = shutdown.changed() => return,
        };
        let Some(request) = request else {
            return; // clean EOF
        };

        let response = dispatch(&facade, &request);
        if let Err(err) = write_frame(&mut conn, &response).await {
            debug!(error = %err, "rpc write failed, closing connection");
            return;
        }
    }
}

fn dispatch(facade: &Facade, request: &Request) -> Response {
    let id = request.id;
    let result = match request.method.as_str() {
        "ControlPlane.GetService" => {
            with_id(&request.params, |sid| to_value(facade.get_service(sid)))
        }
        "ControlPlane.GetServices" => to_value(facade.get_services()),
        "ControlPlane.GetTaggedServices" => {
            match serde_json::from_value::<Vec<String>>(request.params.clone()) {
                Ok(tags) => to_value(facade.get_tagged_services(&tags)),
                Err(err) => bad_params(err),
            }
        }
        "ControlPlane.AddService" => {
            match serde_json::from_value::<Service>(request.params.clone()) {
                Ok(svc) => to_value(facade.add_service(svc).map(|()| Value::Null)),
                Err(err) => bad_params(err),
            }
        }
        "ControlPlane.UpdateService" => {
            match serde_json::from_value::<Service>(request.params.clone()) {
                Ok(svc) => to_value(facade.update_service(svc).map(|()| Value::Null)),
                Err(err) => bad_params(err),
            }
        }
        "ControlPlane.RemoveService" => {
            match serde_json::from_value::<RemoveServiceParams>(request.params.clone()) {
                Ok(params) => to_value(
                    facade
                        .remove_service(&params.service_id, params.remove_assignments)
                        .map(|()| Value::Null),
                ),
                Err(err) => bad_params(err),
            }
        }
        "ControlPlane.AssignIPs" => {
            match serde_json::from_value::<AssignmentRequest>(request.params.clone()) {
                Ok(req) => to_value(facade.assign_ips(&req).map(|()| Value::Null)),
                Err(err) => bad_params(err),
            }
        }
        "ControlPlane.StartService" => {
            with_id(&request.params, |sid| {
                to_value(facade.start_service(sid).map(|()| Value::Null))
            })
        }
        "ControlPlane.StopService" => {
            with_id(&request.params, |sid| {
                to_value(facade.stop_service(sid).map(|()| Value::Null))
            })
        }
        "ControlPlane.PauseService" => {
            with_id(&request.params, |sid| {
                to_value(facade.pause_service(sid).map(|()| Value::Null))
            })
        }
        "ControlPlane.GetServiceEndpoints" => {
            with_id(&request.params, |sid| {
                to_value(facade.get_service_endpoints(sid))
            })
        }
        "ControlPlane.GetTenantId" => {
            with_id(&request.params, |sid| to_value(facade.tenant_id(sid)))
        }
        "ControlPlane.GetHost" => with_id(&request.params, |hid| to_value(facade.get_host(hid))),
        "ControlPlane.UpdateHost" => {
            match serde_json::from_value::<Host>(request.params.clone()) {
                Ok(host) => to_value(facade.update_host(&host).map(|()| Value::Null)),
                Err(err) => bad_params(err),
            }
        }
        "ControlPlane.ValidateCredentials" => {
            match serde_json::from_value::<User>(request.params.clone()) {
                Ok(user) => to_value(facade.validate_credentials(&user.name, &user.password)),
                Err(err) => bad_params(err),
            }
        }
        "ControlPlane.GetSystemUser" => to_value(facade.get_system_user()),
        "ControlPlane.LogHealthCheck" => {
            match serde_json::from_value::<HealthCheckParams>(request.params.clone()) {
                Ok(params) => {
                    info!(component = %params.component, status = %params.status, "health check");
                    Ok(Value::Null)
                }
                Err(err) => bad_params(err),
            }
        }
        other => Err((
            ErrorKind::InvalidArgument,
            format!("unknown method {other}"),
        )),
    };

    match result {
        Ok(value) => Response::ok(id, value),
        Err((kind, message)) => {
            debug!(method = %request.method, %kind, message, "rpc call failed");
            Response::fail(id, kind, message)
        }
    }
}

type DispatchResult = Result<Value, (ErrorKind, String)>;

fn with_id(params: &Value, f: impl FnOnce(&str) -> DispatchResult) -> DispatchResult {
    match params.as_str() {
        Some(id) => f(id),
        None => Err((
            ErrorKind::InvalidArgument,
            "expected a string id parameter".to_string(),
        )),
    }
}

fn bad_params(err: serde_json::Error) -> DispatchResult {
    Err((
        ErrorKind::InvalidArgument,
        format!("malformed parameters: {err}"),
    ))
}

fn to_value<T: serde::Serialize>(
    result: Result<T, harbor_facade::FacadeError>,
) -> DispatchResult {
    match result {
        Ok(value) => serde_json::to_value(value)
            .map_err(|e| (ErrorKind::InvalidArgument, e.to_string())),
        Err(err) => Err((err.kind(), err.to_string())),
    }
}
