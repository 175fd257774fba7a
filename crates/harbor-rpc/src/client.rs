//! The typed RPC client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use harbor_model::{
    ApplicationEndpoint, AssignmentRequest, Host, Service, User,
};

use crate::protocol::{read_frame, write_frame, Request, Response};
use crate::{RpcError, RpcResult};

/// Default bound on establishing the TCP connection.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// A client for the master's `ControlPlane` service.
///
/// Calls are serialized over one connection; a transport failure drops
/// the connection and the next call redials.
pub struct ControlClient {
    addr: String,
    dial_timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
    next_id: AtomicU64,
}

impl ControlClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            dial_timeout: DIAL_TIMEOUT,
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Issue one call, redialing if the connection is gone.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> RpcResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, method, params);

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let dial = TcpStream::connect(&self.addr);
            let stream = match tokio::time::timeout(self.dial_timeout, dial).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(RpcError::DialTimeout(self.dial_timeout)),
            };
            debug!(addr = %self.addr, "rpc client connected");
            *guard = Some(stream);
        }
        let conn = guard.as_mut().expect("connection just established");

        let outcome = async {
            write_frame(conn, &request).await?;
            let response: Option<Response> = read_frame(conn).await?;
            response.ok_or_else(|| RpcError::Protocol("connection closed mid-call".to_string()))
        }
        .await;

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                // Poisoned connection: drop it so the next call redials.
                *guard = None;
                return Err(err);
            }
        };

        if response.id != id {
            *guard = None;
            return Err(RpcError::Protocol(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        if let Some(failure) = response.error {
            return Err(RpcError::Remote {
                kind: failure.kind,
                message: failure.message,
            });
        }
        let value = response.result.unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| RpcError::Protocol(e.to_string()))
    }

    // ── Typed surface ──────────────────────────────────────────────

    pub async fn get_service(&self, id: &str) -> RpcResult<Service> {
        self.call("ControlPlane.GetService", Value::String(id.into()))
            .await
    }

    pub async fn get_services(&self) -> RpcResult<Vec<Service>> {
        self.call("ControlPlane.GetServices", Value::Null).await
    }

    pub async fn add_service(&self, svc: &Service) -> RpcResult<()> {
        self.call::<Value>("ControlPlane.AddService", to_params(svc)?)
            .await?;
        Ok(())
    }

    pub async fn update_service(&self, svc: &Service) -> RpcResult<()> {
        self.call::<Value>("ControlPlane.UpdateService", to_params(svc)?)
            .await?;
        Ok(())
    }

    pub async fn remove_service(&self, id: &str, remove_assignments: bool) -> RpcResult<()> {
        let params = serde_json::json!({
            "service_id": id,
            "remove_assignments": remove_assignments,
        });
        self.call::<Value>("ControlPlane.RemoveService", params)
            .await?;
        Ok(())
    }

    pub async fn assign_ips(&self, request: &AssignmentRequest) -> RpcResult<()> {
        self.call::<Value>("ControlPlane.AssignIPs", to_params(request)?)
            .await?;
        Ok(())
    }

    pub async fn start_service(&self, id: &str) -> RpcResult<()> {
        self.call::<Value>("ControlPlane.StartService", Value::String(id.into()))
            .await?;
        Ok(())
    }

    pub async fn stop_service(&self, id: &str) -> RpcResult<()> {
        self.call::<Value>("ControlPlane.StopService", Value::String(id.into()))
            .await?;
        Ok(())
    }

    pub async fn pause_service(&self, id: &str) -> RpcResult<()> {
        self.call::<Value>("ControlPlane.PauseService", Value::String(id.into()))
            .await?;
        Ok(())
    }

    pub async fn get_service_endpoints(
        &self,
        id: &str,
    ) -> RpcResult<HashMap<String, Vec<ApplicationEndpoint>>> {
        self.call("ControlPlane.GetServiceEndpoints", Value::String(id.into()))
            .await
    }

    pub async fn get_tenant_id(&self, id: &str) -> RpcResult<String> {
        self.call("ControlPlane.GetTenantId", Value::String(id.into()))
            .await
    }

    pub async fn get_host(&self, id: &str) -> RpcResult<Option<Host>> {
        self.call("ControlPlane.GetHost", Value::String(id.into()))
            .await
    }

    pub async fn update_host(&self, host: &Host) -> RpcResult<()> {
        self.call::<Value>("ControlPlane.UpdateHost", to_params(host)?)
            .await?;
        Ok(())
    }

    pub async fn validate_credentials(&self, user: &User) -> RpcResult<bool> {
        self.call("ControlPlane.ValidateCredentials", to_params(user)?)
            .await
    }

    pub async fn get_system_user(&self) -> RpcResult<User> {
        self.call("ControlPlane.GetSystemUser", Value::Null).await
    }

    pub async fn log_health_check(&self, component: &str, status: &str) -> RpcResult<()> {
        let params = serde_json::json!({ "component": component, "status": status });
        self.call::<Value>("ControlPlane.LogHealthCheck", params)
            .await?;
        Ok(())
    }
}

fn to_params<T: serde::Serialize>(value: &T) -> RpcResult<Value> {
    serde_json::to_value(value).map_err(|e| RpcError::Protocol(e.to_string()))
}

// ── Seam implementations ─────────────────────────────────────────────

#[async_trait]
impl harbor_agent::MasterClient for ControlClient {
    async fn get_host(&self, host_id: &str) -> Result<Option<Host>, harbor_agent::AgentError> {
        ControlClient::get_host(self, host_id)
            .await
            .map_err(|e| harbor_agent::AgentError::Master(e.to_string()))
    }

    async fn update_host(&self, host: &Host) -> Result<(), harbor_agent::AgentError> {
        ControlClient::update_host(self, host)
            .await
            .map_err(|e| harbor_agent::AgentError::Master(e.to_string()))
    }

    async fn service_endpoints(
        &self,
        service_id: &str,
    ) -> Result<HashMap<String, Vec<ApplicationEndpoint>>, harbor_agent::AgentError> {
        self.get_service_endpoints(service_id)
            .await
            .map_err(|e| harbor_agent::AgentError::Master(e.to_string()))
    }
}

#[async_trait]
impl harbor_proxy::EndpointSource for ControlClient {
    async fn service_endpoints(
        &self,
        service_id: &str,
    ) -> Result<HashMap<String, Vec<ApplicationEndpoint>>, harbor_proxy::ProxyError> {
        self.get_service_endpoints(service_id)
            .await
            .map_err(|e| harbor_proxy::ProxyError::Refresh(e.to_string()))
    }
}
