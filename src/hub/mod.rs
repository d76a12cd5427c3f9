//! Real-time hub: connection lifecycle, inbound dispatch and group broadcast.
//!
//! The hub never touches sockets. A transport adapter calls [`Hub::connect`]
//! when a client arrives, feeds every inbound transport message to
//! [`Hub::on_receive`], writes whatever shows up on the connection's outbound
//! queue, and calls [`Hub::disconnect`] when the client goes away.
//! [`Hub::run_connection`] wires all of that to any [`Transport`].

pub mod clients;
pub mod handler;
pub mod registry;

pub use clients::{Audience, ClientProxy, HubClients, HubGroups};
pub use handler::{HubContext, HubHandler, InvocationError};
pub use registry::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionState, Delivery, SendError,
};

use crate::config::HubConfig;
use crate::protocol::framing::{FrameIter, FramingError};
use crate::protocol::handshake::{self, HandshakeError, HandshakeResponse};
use crate::protocol::{
    CloseMessage, CompletionMessage, HubMessage, InvocationMessage, MessagePackHubProtocol,
    ProtocolError,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[cfg(test)]
mod tests;

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("failed to queue frame: {0}")]
    Send(#[from] SendError),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("connection '{0}' is not registered")]
    UnknownConnection(String),
}

impl HubError {
    /// Reason reported to the client in a close message.
    ///
    /// Handshake failures already answered with a handshake error response, so
    /// they get no close message.
    pub fn close_reason(&self) -> Option<String> {
        match self {
            Self::Handshake(_) | Self::UnknownConnection(_) => None,
            other => Some(format!("Connection closed with an error. {}", other)),
        }
    }
}

/// What the transport should do after an inbound message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Continue,
    /// The client sent a close message.
    Closed,
}

/// Bidirectional message channel for one connection.
#[async_trait]
pub trait Transport: Send {
    /// Next inbound transport message. `None` once the peer has gone away.
    async fn recv(&mut self) -> Option<anyhow::Result<Vec<u8>>>;

    async fn send(&mut self, frame: Bytes) -> anyhow::Result<()>;

    async fn close(&mut self) {}
}

/// Per-connection state owned by whoever drives the transport.
pub struct Session {
    handle: Arc<ConnectionHandle>,
    handshake_buffer: BytesMut,
    last_received: Instant,
}

impl Session {
    fn new(handle: Arc<ConnectionHandle>) -> Self {
        Self {
            handle,
            handshake_buffer: BytesMut::new(),
            last_received: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Time since the last inbound message.
    pub fn idle_for(&self) -> Duration {
        self.last_received.elapsed()
    }

    fn touch(&mut self) {
        self.last_received = Instant::now();
    }
}

/// A hub serving one `HubHandler`.
pub struct Hub<H: HubHandler> {
    registry: Arc<ConnectionRegistry>,
    handler: H,
    config: HubConfig,
}

impl<H: HubHandler> Hub<H> {
    pub fn new(handler: H, config: HubConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.send_timeout()));
        Self {
            registry,
            handler,
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Broadcast access for code outside hub methods (e.g. HTTP handlers).
    pub fn clients(&self) -> HubClients {
        HubClients::new(Arc::clone(&self.registry))
    }

    fn context(&self, connection_id: &str) -> HubContext {
        HubContext::new(
            connection_id,
            self.clients(),
            HubGroups::new(Arc::clone(&self.registry)),
        )
    }

    /// Register a new connection in the Connecting state.
    ///
    /// Returns the session to pass to `on_receive` and the receiving half of
    /// the connection's outbound frame queue.
    pub fn connect(&self) -> (Session, mpsc::Receiver<Bytes>) {
        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let handle = Arc::new(ConnectionHandle::new(id.clone(), tx));
        self.registry.add(Arc::clone(&handle));

        debug!(connection_id = %id, "Connection opened, awaiting handshake");
        (Session::new(handle), rx)
    }

    /// Handle one inbound transport message.
    ///
    /// Any error is fatal for the connection: the caller should close it and
    /// call `disconnect`.
    pub async fn on_receive(
        &self,
        session: &mut Session,
        data: &[u8],
    ) -> Result<ReceiveOutcome, HubError> {
        session.touch();

        if data.len() > self.config.max_message_size {
            return Err(HubError::MessageTooLarge {
                size: data.len(),
                limit: self.config.max_message_size,
            });
        }

        match session.state() {
            ConnectionState::Connecting => match self.complete_handshake(session, data).await? {
                Some(rest) if !rest.is_empty() => self.dispatch(session, &rest).await,
                _ => Ok(ReceiveOutcome::Continue),
            },
            ConnectionState::Connected => self.dispatch(session, data).await,
            ConnectionState::Disconnected => {
                Err(HubError::UnknownConnection(session.id().to_string()))
            }
        }
    }

    /// Remove the connection from the registry and all of its groups.
    ///
    /// Idempotent. After this returns no broadcast will deliver to it.
    pub async fn disconnect(&self, session: &Session) {
        let was_connected = session.is_connected();
        let Some(handle) = self.registry.remove(session.id()) else {
            return;
        };

        if was_connected {
            self.handler
                .on_disconnected(&self.context(session.id()))
                .await;
        }
        info!(
            connection_id = %session.id(),
            open_for_ms = handle.open_for().num_milliseconds(),
            "Hub connection closed"
        );
    }

    /// Drive one connection over `transport` until either side closes it.
    pub async fn run_connection<T: Transport>(&self, mut transport: T) {
        let (mut session, mut outbound) = self.connect();

        let handshake_deadline = tokio::time::sleep(self.config.handshake_timeout());
        tokio::pin!(handshake_deadline);

        let period = self.config.keep_alive_interval();
        let mut keep_alive = tokio::time::interval_at(Instant::now() + period, period);

        let close_reason = loop {
            tokio::select! {
                inbound = transport.recv() => match inbound {
                    Some(Ok(data)) => {
                        let received = self
                            .receive_while_flushing(&mut session, &data, &mut outbound, &mut transport)
                            .await;
                        match received {
                            Ok(Ok(ReceiveOutcome::Continue)) => {}
                            Ok(Ok(ReceiveOutcome::Closed)) => break None,
                            Ok(Err(e)) => {
                                warn!(connection_id = %session.id(), error = %e, "Closing connection after error");
                                break e.close_reason();
                            }
                            Err(e) => {
                                warn!(connection_id = %session.id(), error = %e, "Failed to write to transport");
                                break None;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %session.id(), error = %e, "Transport error");
                        break None;
                    }
                    None => {
                        debug!(connection_id = %session.id(), "Transport closed by client");
                        break None;
                    }
                },

                Some(frame) = outbound.recv() => {
                    if let Err(e) = transport.send(frame).await {
                        warn!(connection_id = %session.id(), error = %e, "Failed to write to transport");
                        break None;
                    }
                }

                _ = keep_alive.tick(), if session.is_connected() => {
                    if session.idle_for() >= self.config.client_timeout() {
                        warn!(connection_id = %session.id(), "Client timeout elapsed, closing connection");
                        break Some(
                            "Server timeout elapsed without receiving a message from the client."
                                .to_string(),
                        );
                    }
                    if let Err(e) = transport.send(MessagePackHubProtocol::ping_frame()).await {
                        warn!(connection_id = %session.id(), error = %e, "Failed to send keep-alive ping");
                        break None;
                    }
                }

                _ = &mut handshake_deadline, if !session.is_connected() => {
                    warn!(connection_id = %session.id(), "Handshake was not received in time");
                    break None;
                }
            }
        };

        // Stop new broadcasts first, then flush what is already queued
        // (completions, handshake error responses).
        self.disconnect(&session).await;
        outbound.close();
        while let Ok(frame) = outbound.try_recv() {
            if transport.send(frame).await.is_err() {
                break;
            }
        }

        if let Some(reason) = close_reason {
            let close = HubMessage::Close(CloseMessage::with_error(reason));
            if let Ok(frame) = MessagePackHubProtocol::write_message(&close) {
                let _ = transport.send(frame).await;
            }
        }
        transport.close().await;
    }

    /// Handle one inbound message while writing out whatever the connection's
    /// queue receives in the meantime.
    ///
    /// Hub methods broadcast to their own caller, so the queue must keep
    /// draining while they run. After a write error the remaining frames are
    /// discarded and the error is returned once handling finishes.
    async fn receive_while_flushing<T: Transport>(
        &self,
        session: &mut Session,
        data: &[u8],
        outbound: &mut mpsc::Receiver<Bytes>,
        transport: &mut T,
    ) -> anyhow::Result<Result<ReceiveOutcome, HubError>> {
        let receive = self.on_receive(session, data);
        tokio::pin!(receive);

        let mut write_error = None;
        let outcome = loop {
            tokio::select! {
                biased;

                outcome = &mut receive => break outcome,

                Some(frame) = outbound.recv() => {
                    if write_error.is_none() {
                        if let Err(e) = transport.send(frame).await {
                            write_error = Some(e);
                        }
                    }
                }
            }
        };

        match write_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Accumulate handshake bytes until a full request has arrived.
    ///
    /// Returns `None` while incomplete, otherwise the bytes that followed the
    /// handshake record.
    async fn complete_handshake(
        &self,
        session: &mut Session,
        data: &[u8],
    ) -> Result<Option<Bytes>, HubError> {
        session.handshake_buffer.extend_from_slice(data);
        if session.handshake_buffer.len() > self.config.max_message_size {
            return Err(HubError::MessageTooLarge {
                size: session.handshake_buffer.len(),
                limit: self.config.max_message_size,
            });
        }

        let (request, consumed) = match handshake::parse_request(&session.handshake_buffer) {
            Ok(Some(found)) => found,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.reject_handshake(session, &e);
                return Err(e.into());
            }
        };
        if let Err(e) = request.validate() {
            self.reject_handshake(session, &e);
            return Err(e.into());
        }

        // The response must be queued before the connection becomes a
        // broadcast target.
        let response = handshake::write_response(&HandshakeResponse::default())?;
        session.handle.try_send_raw(Bytes::from(response))?;

        let rest = session.handshake_buffer.split_off(consumed).freeze();
        session.handshake_buffer = BytesMut::new();
        session.handle.mark_connected();

        info!(
            connection_id = %session.id(),
            protocol = %request.protocol,
            version = request.version,
            "Hub connection established"
        );
        self.handler.on_connected(&self.context(session.id())).await;

        Ok(Some(rest))
    }

    fn reject_handshake(&self, session: &Session, error: &HandshakeError) {
        warn!(connection_id = %session.id(), error = %error, "Handshake rejected");
        if let Ok(response) = handshake::write_response(&HandshakeResponse::error(error.to_string()))
        {
            let _ = session.handle.try_send_raw(Bytes::from(response));
        }
    }

    async fn dispatch(&self, session: &Session, data: &[u8]) -> Result<ReceiveOutcome, HubError> {
        for payload in FrameIter::new(data) {
            let Some(message) = MessagePackHubProtocol::decode(payload?)? else {
                continue;
            };

            match message {
                HubMessage::Invocation(invocation) => self.invoke(session, invocation).await,
                HubMessage::StreamInvocation(invocation) => {
                    warn!(
                        connection_id = %session.id(),
                        target = %invocation.target,
                        "Streaming invocation rejected"
                    );
                    let completion = CompletionMessage::with_error(
                        invocation.invocation_id,
                        "Streaming hub methods are not supported.",
                    );
                    self.complete(session, completion).await;
                }
                HubMessage::Ping => trace!(connection_id = %session.id(), "Ping received"),
                HubMessage::Close(close) => {
                    info!(
                        connection_id = %session.id(),
                        error = ?close.error,
                        "Client sent close message"
                    );
                    return Ok(ReceiveOutcome::Closed);
                }
                other => debug!(
                    connection_id = %session.id(),
                    message_type = ?other.message_type(),
                    "Ignoring unsupported message"
                ),
            }
        }
        Ok(ReceiveOutcome::Continue)
    }

    async fn invoke(&self, session: &Session, invocation: InvocationMessage) {
        debug!(
            connection_id = %session.id(),
            target = %invocation.target,
            invocation_id = ?invocation.invocation_id,
            "Invocation received"
        );

        let ctx = self.context(session.id());
        let result = self
            .handler
            .on_invocation(&ctx, &invocation.target, invocation.arguments)
            .await;

        if let Err(e) = &result {
            warn!(
                connection_id = %session.id(),
                target = %invocation.target,
                error = %e,
                "Hub method failed"
            );
        }

        let Some(invocation_id) = invocation.invocation_id else {
            return;
        };
        let completion = match result {
            Ok(Some(value)) => CompletionMessage::with_result(invocation_id, value),
            Ok(None) => CompletionMessage::void(invocation_id),
            Err(e) => CompletionMessage::with_error(invocation_id, e.to_string()),
        };
        self.complete(session, completion).await;
    }

    async fn complete(&self, session: &Session, completion: CompletionMessage) {
        let frame = match MessagePackHubProtocol::write_message(&HubMessage::Completion(completion)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection_id = %session.id(), error = %e, "Failed to encode completion");
                return;
            }
        };
        if let Err(e) = session.handle.send(frame, self.registry.send_timeout()).await {
            warn!(connection_id = %session.id(), error = %e, "Failed to send completion");
        }
    }
}
