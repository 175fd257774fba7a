//! The agent's view of the master.

use std::collections::HashMap;

use async_trait::async_trait;

use harbor_model::{ApplicationEndpoint, Host};

use crate::AgentResult;

/// Master RPC operations the agent depends on.
///
/// Backed by the JSON-over-TCP client in production and by fakes in
/// tests.
#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Fetch this host's registration, if the master knows it.
    async fn get_host(&self, host_id: &str) -> AgentResult<Option<Host>>;

    /// Push current host facts (address, resources) back to the master.
    async fn update_host(&self, host: &Host) -> AgentResult<()>;

    /// Resolve the imported endpoints of a service to live exporters.
    async fn service_endpoints(
        &self,
        service_id: &str,
    ) -> AgentResult<HashMap<String, Vec<ApplicationEndpoint>>>;
}
