use crate::hub::clients::{HubClients, HubGroups};
use crate::hub::registry::ConnectionId;
use crate::protocol::ProtocolError;
use async_trait::async_trait;
use rmpv::Value;
use thiserror::Error;

/// Errors a hub method can return. Reported to the caller in a completion
/// message; the connection stays open.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("Unknown hub method '{0}'")]
    UnknownMethod(String),

    #[error("Invalid arguments for '{method}': {reason}")]
    InvalidArguments { method: String, reason: String },

    #[error("{0}")]
    Failed(String),

    #[error("Failed to send to clients: {0}")]
    Protocol(#[from] ProtocolError),
}

/// What a hub method sees about the call: the calling connection plus access
/// to the broadcaster and group membership.
pub struct HubContext {
    connection_id: ConnectionId,
    clients: HubClients,
    groups: HubGroups,
}

impl HubContext {
    pub fn new(connection_id: impl Into<ConnectionId>, clients: HubClients, groups: HubGroups) -> Self {
        Self {
            connection_id: connection_id.into(),
            clients,
            groups,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn clients(&self) -> &HubClients {
        &self.clients
    }

    pub fn groups(&self) -> &HubGroups {
        &self.groups
    }
}

/// Application logic behind a hub.
///
/// `on_invocation` receives every decoded `Invocation` from a connected
/// client. Returning `Ok(Some(value))` produces a non-void completion when
/// the client supplied an invocation id; errors become error completions.
#[async_trait]
pub trait HubHandler: Send + Sync + 'static {
    async fn on_connected(&self, _ctx: &HubContext) {}

    async fn on_disconnected(&self, _ctx: &HubContext) {}

    async fn on_invocation(
        &self,
        ctx: &HubContext,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<Option<Value>, InvocationError>;
}
