use anyhow::{bail, Context, Result};
use auction_hub::auction::Auction;
use auction_hub::protocol::handshake::{self, HandshakeRequest};
use auction_hub::protocol::{HubMessage, InvocationMessage, MessagePackHubProtocol};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rmpv::Value;
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// REST access to the auction server
pub struct AuctionClient {
    http: reqwest::Client,
    base_url: String,
}

impl AuctionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// WebSocket URL of the hub at `hub_path`.
    pub fn hub_url(&self, hub_path: &str) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}{}", ws_base, hub_path)
    }

    pub async fn list_auctions(&self) -> Result<Vec<Auction>> {
        let url = format!("{}/auctions", self.base_url);
        let auctions = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?
            .error_for_status()
            .context("Auction list request failed")?
            .json()
            .await
            .context("Failed to parse auction list")?;
        Ok(auctions)
    }

    /// Record a bid on the server.
    pub async fn place_bid(&self, auction_id: i32, new_bid: i32) -> Result<()> {
        let url = format!(
            "{}/auction/{}/newbid?currentBid={}",
            self.base_url, auction_id, new_bid
        );
        self.http
            .post(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?
            .error_for_status()
            .with_context(|| format!("Bid on auction {} was rejected", auction_id))?;
        Ok(())
    }
}

/// A MessagePack hub connection over a WebSocket
pub struct HubConnection {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    /// Messages decoded but not yet handed out
    pending: VecDeque<HubMessage>,
    next_invocation_id: u64,
}

impl HubConnection {
    /// Open the WebSocket and complete the handshake.
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _response) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        let (write, read) = stream.split();
        let mut connection = Self {
            write,
            read,
            pending: VecDeque::new(),
            next_invocation_id: 1,
        };

        let request = handshake::write_request(&HandshakeRequest::messagepack())?;
        connection.write.send(Message::Binary(request)).await?;
        connection.read_handshake_response().await?;

        info!(url = %url, "Hub connection established");
        Ok(connection)
    }

    async fn read_handshake_response(&mut self) -> Result<()> {
        let mut buffer = Vec::new();
        loop {
            let Some(data) = self.read_data().await? else {
                bail!("Connection closed during handshake");
            };
            buffer.extend_from_slice(&data);

            let Some((response, consumed)) = handshake::parse_response(&buffer)? else {
                continue;
            };
            response.into_result()?;
            let rest = &buffer[consumed..];
            if !rest.is_empty() {
                self.pending
                    .extend(MessagePackHubProtocol::parse_messages(rest)?);
            }
            return Ok(());
        }
    }

    /// Next transport payload, answering WebSocket pings on the way.
    async fn read_data(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Ping(data))) => {
                    self.write.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Next hub message, or `None` once the server has closed the connection.
    pub async fn next_message(&mut self) -> Result<Option<HubMessage>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(message));
            }
            let Some(data) = self.read_data().await? else {
                return Ok(None);
            };
            self.pending
                .extend(MessagePackHubProtocol::parse_messages(&data)?);
        }
    }

    /// Invoke a hub method and return the invocation id its completion will carry.
    pub async fn invoke(&mut self, target: &str, arguments: Vec<Value>) -> Result<String> {
        let invocation_id = self.next_invocation_id.to_string();
        self.next_invocation_id += 1;

        let message = HubMessage::Invocation(InvocationMessage::with_id(
            invocation_id.clone(),
            target,
            arguments,
        ));
        let frame = MessagePackHubProtocol::write_message(&message)?;
        self.write.send(Message::Binary(frame.to_vec())).await?;

        debug!(target = %target, invocation_id = %invocation_id, "Invocation sent");
        Ok(invocation_id)
    }

    /// Keep-alive ping so the server does not time the connection out.
    pub async fn ping(&mut self) -> Result<()> {
        let frame = MessagePackHubProtocol::ping_frame();
        self.write.send(Message::Binary(frame.to_vec())).await?;
        Ok(())
    }

    pub async fn close(mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }
}
