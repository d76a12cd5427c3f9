//! MessagePack hub protocol.
//!
//! Each message is a MessagePack array read positionally, never a map with
//! field names. Position 0 is the message type tag; position 1 holds the
//! headers map for every message type except `Ping` and `Close`.
//!
//! | Type               | Layout                                                   |
//! |--------------------|----------------------------------------------------------|
//! | `Invocation`       | `[1, headers, invocationId/nil, target, args, streamIds?]` |
//! | `StreamItem`       | `[2, headers, invocationId, item]`                       |
//! | `Completion`       | `[3, headers, invocationId, resultKind, payload?]`       |
//! | `StreamInvocation` | `[4, headers, invocationId, target, args, streamIds?]`   |
//! | `CancelInvocation` | `[5, headers, invocationId]`                             |
//! | `Ping`             | `[6]`                                                    |
//! | `Close`            | `[7, error?, allowReconnect?]`                           |
//!
//! Decoders only check minimum lengths so newer peers may append fields
//! inside the array; bytes after the array are rejected. Unknown message
//! types, negative tags included, decode to `None` and are skipped.

use super::framing::{self, FramingError};
use super::message::{
    CancelInvocationMessage, CloseMessage, CompletionKind, CompletionMessage, Headers,
    HubMessage, InvocationMessage, MessageType, StreamInvocationMessage, StreamItemMessage,
};
use bytes::Bytes;
use rmpv::Value;
use thiserror::Error;
use tracing::info;

/// Protocol name negotiated during the handshake.
pub const PROTOCOL_NAME: &str = "messagepack";

/// Protocol version negotiated during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Pre-encoded `[6]`, the ping message with no headers.
pub const SERIALIZED_PING: [u8; 2] = [0x91, MessageType::Ping as u8];

/// `SERIALIZED_PING` with its length prefix.
const FRAMED_PING: [u8; 3] = [0x02, 0x91, MessageType::Ping as u8];

/// Errors raised while encoding or decoding hub messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid headers")]
    InvalidHeaders,

    #[error("malformed MessagePack: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("failed to encode MessagePack: {0}")]
    Encode(String),

    #[error(transparent)]
    Framing(#[from] FramingError),
}

fn invalid(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPayload(reason.into())
}

/// Encoder/decoder for the MessagePack hub protocol.
pub struct MessagePackHubProtocol;

impl MessagePackHubProtocol {
    /// Encode and frame one message, ready for the wire.
    pub fn write_message(message: &HubMessage) -> Result<Bytes, ProtocolError> {
        if let HubMessage::Ping = message {
            return Ok(Self::ping_frame());
        }
        let payload = Self::encode(message)?;
        Ok(framing::write(&payload))
    }

    /// The framed keep-alive ping, shared without re-encoding.
    pub fn ping_frame() -> Bytes {
        Bytes::from_static(&FRAMED_PING)
    }

    /// Split a buffer into frames and decode each one, skipping unknown types.
    pub fn parse_messages(buffer: &[u8]) -> Result<Vec<HubMessage>, ProtocolError> {
        let mut messages = Vec::new();
        for payload in framing::FrameIter::new(buffer) {
            if let Some(message) = Self::decode(payload?)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Encode one message without its length prefix.
    pub fn encode(message: &HubMessage) -> Result<Vec<u8>, ProtocolError> {
        let items = match message {
            HubMessage::Ping => return Ok(SERIALIZED_PING.to_vec()),
            HubMessage::Invocation(m) => invocation_items(
                MessageType::Invocation,
                &m.headers,
                m.invocation_id.as_deref(),
                &m.target,
                &m.arguments,
                m.stream_ids.as_deref(),
            ),
            HubMessage::StreamInvocation(m) => invocation_items(
                MessageType::StreamInvocation,
                &m.headers,
                Some(&m.invocation_id),
                &m.target,
                &m.arguments,
                m.stream_ids.as_deref(),
            ),
            HubMessage::StreamItem(m) => vec![
                tag(MessageType::StreamItem),
                headers_value(&m.headers),
                Value::from(m.invocation_id.as_str()),
                m.item.clone(),
            ],
            HubMessage::Completion(m) => completion_items(m),
            HubMessage::CancelInvocation(m) => vec![
                tag(MessageType::CancelInvocation),
                headers_value(&m.headers),
                Value::from(m.invocation_id.as_str()),
            ],
            HubMessage::Close(m) => {
                let mut items = vec![
                    tag(MessageType::Close),
                    m.error.as_deref().map_or(Value::Nil, Value::from),
                ];
                if let Some(allow_reconnect) = m.allow_reconnect {
                    items.push(Value::Boolean(allow_reconnect));
                }
                items
            }
        };

        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::Array(items))
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode one payload (no length prefix).
    ///
    /// Returns `Ok(None)` for message types this implementation does not know.
    pub fn decode(payload: &[u8]) -> Result<Option<HubMessage>, ProtocolError> {
        if payload.is_empty() {
            return Err(invalid("empty message"));
        }

        let mut reader = payload;
        let mut items = match rmpv::decode::read_value(&mut reader)? {
            Value::Array(items) => items,
            _ => return Err(invalid("message is not an array")),
        };
        if !reader.is_empty() {
            return Err(invalid(format!(
                "{} trailing bytes after message",
                reader.len()
            )));
        }
        if items.is_empty() {
            return Err(invalid("message array is empty"));
        }

        let Value::Integer(raw_type) = &items[0] else {
            return Err(invalid("message type is not an integer"));
        };
        let Some(message_type) = raw_type.as_u64().and_then(MessageType::from_tag) else {
            info!(message_type = ?raw_type, "Unknown message type ignored");
            return Ok(None);
        };

        let message = match message_type {
            MessageType::Invocation => {
                require_len(&items, 5, "Invocation")?;
                let headers = read_headers(&mut items)?;
                let invocation_id = match take(&mut items, 2) {
                    Value::Nil => None,
                    other => Some(into_string(other, "invocation id")?),
                };
                HubMessage::Invocation(InvocationMessage {
                    headers,
                    invocation_id,
                    target: into_string(take(&mut items, 3), "target")?,
                    arguments: into_array(take(&mut items, 4), "arguments")?,
                    stream_ids: read_stream_ids(&mut items)?,
                })
            }
            MessageType::StreamInvocation => {
                require_len(&items, 5, "StreamInvocation")?;
                let headers = read_headers(&mut items)?;
                HubMessage::StreamInvocation(StreamInvocationMessage {
                    headers,
                    invocation_id: into_string(take(&mut items, 2), "invocation id")?,
                    target: into_string(take(&mut items, 3), "target")?,
                    arguments: into_array(take(&mut items, 4), "arguments")?,
                    stream_ids: read_stream_ids(&mut items)?,
                })
            }
            MessageType::StreamItem => {
                require_len(&items, 4, "StreamItem")?;
                let headers = read_headers(&mut items)?;
                HubMessage::StreamItem(StreamItemMessage {
                    headers,
                    invocation_id: into_string(take(&mut items, 2), "invocation id")?,
                    item: take(&mut items, 3),
                })
            }
            MessageType::Completion => {
                require_len(&items, 4, "Completion")?;
                let kind = items[3]
                    .as_u64()
                    .and_then(CompletionKind::from_code)
                    .ok_or_else(|| invalid("unknown completion result kind"))?;
                if kind.has_payload() {
                    require_len(&items, 5, "Completion")?;
                }
                let headers = read_headers(&mut items)?;
                let invocation_id = into_string(take(&mut items, 2), "invocation id")?;
                let (error, result) = match kind {
                    CompletionKind::Error => {
                        (Some(into_string(take(&mut items, 4), "error")?), None)
                    }
                    CompletionKind::NonVoidResult => (None, Some(take(&mut items, 4))),
                    CompletionKind::VoidResult => (None, None),
                };
                HubMessage::Completion(CompletionMessage {
                    headers,
                    invocation_id,
                    error,
                    result,
                })
            }
            MessageType::CancelInvocation => {
                require_len(&items, 3, "CancelInvocation")?;
                let headers = read_headers(&mut items)?;
                HubMessage::CancelInvocation(CancelInvocationMessage {
                    headers,
                    invocation_id: into_string(take(&mut items, 2), "invocation id")?,
                })
            }
            MessageType::Ping => HubMessage::Ping,
            MessageType::Close => {
                require_len(&items, 2, "Close")?;
                let error = match take(&mut items, 1) {
                    Value::Nil => None,
                    other => Some(into_string(other, "close error")?),
                };
                let allow_reconnect = match items.get(2) {
                    Some(Value::Boolean(b)) => Some(*b),
                    Some(Value::Nil) | None => None,
                    Some(_) => return Err(invalid("allowReconnect is not a boolean")),
                };
                HubMessage::Close(CloseMessage {
                    error,
                    allow_reconnect,
                })
            }
        };

        Ok(Some(message))
    }
}

fn tag(message_type: MessageType) -> Value {
    Value::from(message_type.tag())
}

fn headers_value(headers: &Headers) -> Value {
    Value::Map(
        headers
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
            .collect(),
    )
}

fn invocation_items(
    message_type: MessageType,
    headers: &Headers,
    invocation_id: Option<&str>,
    target: &str,
    arguments: &[Value],
    stream_ids: Option<&[String]>,
) -> Vec<Value> {
    let mut items = vec![
        tag(message_type),
        headers_value(headers),
        invocation_id.map_or(Value::Nil, Value::from),
        Value::from(target),
        Value::Array(arguments.to_vec()),
    ];
    if let Some(stream_ids) = stream_ids {
        items.push(Value::Array(
            stream_ids.iter().map(|id| Value::from(id.as_str())).collect(),
        ));
    }
    items
}

fn completion_items(message: &CompletionMessage) -> Vec<Value> {
    let kind = message.result_kind();
    let mut items = vec![
        tag(MessageType::Completion),
        headers_value(&message.headers),
        Value::from(message.invocation_id.as_str()),
        Value::from(kind as u8),
    ];
    match kind {
        CompletionKind::Error => {
            items.push(message.error.as_deref().map_or(Value::Nil, Value::from))
        }
        CompletionKind::NonVoidResult => {
            items.push(message.result.clone().unwrap_or(Value::Nil))
        }
        CompletionKind::VoidResult => {}
    }
    items
}

fn require_len(items: &[Value], min: usize, kind: &str) -> Result<(), ProtocolError> {
    if items.len() < min {
        return Err(invalid(format!(
            "{} message needs at least {} fields, got {}",
            kind,
            min,
            items.len()
        )));
    }
    Ok(())
}

/// Move the value at `index` out, leaving nil behind.
fn take(items: &mut [Value], index: usize) -> Value {
    std::mem::replace(&mut items[index], Value::Nil)
}

fn read_headers(items: &mut [Value]) -> Result<Headers, ProtocolError> {
    let Value::Map(entries) = take(items, 1) else {
        return Err(ProtocolError::InvalidHeaders);
    };

    entries
        .into_iter()
        .map(|(key, value)| match (key, value) {
            (Value::String(k), Value::String(v)) => match (k.into_str(), v.into_str()) {
                (Some(k), Some(v)) => Ok((k, v)),
                _ => Err(ProtocolError::InvalidHeaders),
            },
            _ => Err(ProtocolError::InvalidHeaders),
        })
        .collect()
}

fn read_stream_ids(items: &mut [Value]) -> Result<Option<Vec<String>>, ProtocolError> {
    if items.len() < 6 {
        return Ok(None);
    }
    match take(items, 5) {
        Value::Nil => Ok(None),
        value => into_array(value, "stream ids")?
            .into_iter()
            .map(|id| into_string(id, "stream id"))
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
    }
}

fn into_string(value: Value, field: &str) -> Result<String, ProtocolError> {
    match value {
        Value::String(s) => s
            .into_str()
            .ok_or_else(|| invalid(format!("{} is not valid UTF-8", field))),
        _ => Err(invalid(format!("{} is not a string", field))),
    }
}

fn into_array(value: Value, field: &str) -> Result<Vec<Value>, ProtocolError> {
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(invalid(format!("{} is not an array", field))),
    }
}
