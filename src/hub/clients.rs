use crate::hub::registry::{ConnectionId, ConnectionRegistry, Delivery};
use crate::protocol::{HubMessage, InvocationMessage, MessagePackHubProtocol, ProtocolError};
use rmpv::Value;
use std::sync::Arc;

/// Who a client proxy sends to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    Group(String),
    OthersInGroup { group: String, sender: ConnectionId },
    Client(ConnectionId),
}

/// Entry point for sending invocations to connected clients.
#[derive(Clone)]
pub struct HubClients {
    registry: Arc<ConnectionRegistry>,
}

impl HubClients {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn all(&self) -> ClientProxy<'_> {
        self.proxy(Audience::All)
    }

    pub fn group(&self, group: impl Into<String>) -> ClientProxy<'_> {
        self.proxy(Audience::Group(group.into()))
    }

    pub fn others_in_group(
        &self,
        group: impl Into<String>,
        sender: impl Into<ConnectionId>,
    ) -> ClientProxy<'_> {
        self.proxy(Audience::OthersInGroup {
            group: group.into(),
            sender: sender.into(),
        })
    }

    pub fn client(&self, connection_id: impl Into<ConnectionId>) -> ClientProxy<'_> {
        self.proxy(Audience::Client(connection_id.into()))
    }

    fn proxy(&self, audience: Audience) -> ClientProxy<'_> {
        ClientProxy {
            registry: &self.registry,
            audience,
        }
    }
}

/// Sends invocations to one audience.
pub struct ClientProxy<'a> {
    registry: &'a ConnectionRegistry,
    audience: Audience,
}

impl ClientProxy<'_> {
    /// Invoke `method` on every client in the audience.
    ///
    /// The message is encoded and framed once and the same bytes are queued for
    /// each target. Per-connection failures only show up in the returned
    /// `Delivery`.
    pub async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<Delivery, ProtocolError> {
        let message = HubMessage::Invocation(InvocationMessage::new(method, arguments));
        let frame = MessagePackHubProtocol::write_message(&message)?;

        let delivery = match &self.audience {
            Audience::All => self.registry.broadcast_all(frame).await,
            Audience::Group(group) => self.registry.broadcast_group(group, frame).await,
            Audience::OthersInGroup { group, sender } => {
                self.registry
                    .broadcast_others_in_group(group, sender, frame)
                    .await
            }
            Audience::Client(id) => self.registry.send_connection(id, frame).await,
        };
        Ok(delivery)
    }
}

/// Group membership operations exposed to hub handlers.
#[derive(Clone)]
pub struct HubGroups {
    registry: Arc<ConnectionRegistry>,
}

impl HubGroups {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn add_to_group(&self, connection_id: &str, group: &str) -> bool {
        self.registry.join(connection_id, group)
    }

    pub fn remove_from_group(&self, connection_id: &str, group: &str) -> bool {
        self.registry.leave(connection_id, group)
    }
}
