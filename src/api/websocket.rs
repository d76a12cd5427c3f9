use crate::hub::{Hub, HubHandler, Transport};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Response for POST {hub}/negotiate
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    pub connection_id: String,
    pub connection_token: String,
    pub negotiate_version: u32,
    pub available_transports: Vec<AvailableTransport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    pub transfer_formats: Vec<String>,
}

/// Hub transport over an axum WebSocket.
///
/// Text and binary frames both carry hub bytes; pings are answered here.
pub struct WebSocketTransport {
    socket: WebSocket,
}

impl WebSocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn recv(&mut self) -> Option<anyhow::Result<Vec<u8>>> {
        loop {
            let msg = match self.socket.recv().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e.into())),
            };
            match msg {
                Message::Binary(data) => return Some(Ok(data)),
                Message::Text(text) => return Some(Ok(text.into_bytes())),
                Message::Ping(data) => {
                    if let Err(e) = self.socket.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Message::Pong(_) => {}
                Message::Close(_) => {
                    debug!("WebSocket close frame received");
                    return None;
                }
            }
        }
    }

    async fn send(&mut self, frame: Bytes) -> anyhow::Result<()> {
        self.socket.send(Message::Binary(frame.to_vec())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

/// Create hub router: WebSocket endpoint at `path` plus `{path}/negotiate`
pub fn create_hub_router<H: HubHandler>(path: &str, hub: Arc<Hub<H>>) -> Router {
    Router::new()
        .route(path, get(hub_ws_handler::<H>))
        .route(&format!("{}/negotiate", path), post(negotiate))
        .with_state(hub)
}

/// GET {hub} - WebSocket upgrade served by the hub
async fn hub_ws_handler<H: HubHandler>(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub<H>>>,
) -> Response {
    info!("Hub WebSocket upgrade request received");
    let max_message_size = hub.config().max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            hub.run_connection(WebSocketTransport::new(socket)).await;
        })
}

/// POST {hub}/negotiate - Advertise the WebSocket/binary transport
async fn negotiate() -> Json<NegotiateResponse> {
    let connection_id = Uuid::new_v4().simple().to_string();
    Json(NegotiateResponse {
        connection_token: connection_id.clone(),
        connection_id,
        negotiate_version: 1,
        available_transports: vec![AvailableTransport {
            transport: "WebSockets".to_string(),
            transfer_formats: vec!["Binary".to_string()],
        }],
    })
}
