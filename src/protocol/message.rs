use rmpv::Value;
use std::collections::HashMap;

/// Message headers carried by every message except `Ping` and `Close`.
pub type Headers = HashMap<String, String>;

/// Integer tag at position 0 of every encoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
}

impl MessageType {
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(Self::Invocation),
            2 => Some(Self::StreamItem),
            3 => Some(Self::Completion),
            4 => Some(Self::StreamInvocation),
            5 => Some(Self::CancelInvocation),
            6 => Some(Self::Ping),
            7 => Some(Self::Close),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A remote call. Without an invocation id no completion is expected.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationMessage {
    pub headers: Headers,
    pub invocation_id: Option<String>,
    pub target: String,
    pub arguments: Vec<Value>,
    pub stream_ids: Option<Vec<String>>,
}

impl InvocationMessage {
    /// Fire-and-forget invocation (no invocation id, no headers).
    pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            headers: Headers::new(),
            invocation_id: None,
            target: target.into(),
            arguments,
            stream_ids: None,
        }
    }

    /// Invocation that expects a completion for `invocation_id`.
    pub fn with_id(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self {
            invocation_id: Some(invocation_id.into()),
            ..Self::new(target, arguments)
        }
    }
}

/// A remote call whose results are streamed back as `StreamItem`s.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInvocationMessage {
    pub headers: Headers,
    pub invocation_id: String,
    pub target: String,
    pub arguments: Vec<Value>,
    pub stream_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamItemMessage {
    pub headers: Headers,
    pub invocation_id: String,
    pub item: Value,
}

/// Outcome of an invocation.
///
/// The encoded result kind follows from the fields: an error wins, then a
/// non-nil result, otherwise the completion is void.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    pub headers: Headers,
    pub invocation_id: String,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl CompletionMessage {
    pub fn void(invocation_id: impl Into<String>) -> Self {
        Self {
            headers: Headers::new(),
            invocation_id: invocation_id.into(),
            error: None,
            result: None,
        }
    }

    pub fn with_result(invocation_id: impl Into<String>, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::void(invocation_id)
        }
    }

    pub fn with_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::void(invocation_id)
        }
    }

    pub fn result_kind(&self) -> CompletionKind {
        if self.error.is_some() {
            CompletionKind::Error
        } else if matches!(&self.result, Some(value) if !value.is_nil()) {
            CompletionKind::NonVoidResult
        } else {
            CompletionKind::VoidResult
        }
    }
}

/// Result kind at position 3 of an encoded completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionKind {
    Error = 1,
    VoidResult = 2,
    NonVoidResult = 3,
}

impl CompletionKind {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Error),
            2 => Some(Self::VoidResult),
            3 => Some(Self::NonVoidResult),
            _ => None,
        }
    }

    pub fn has_payload(self) -> bool {
        !matches!(self, Self::VoidResult)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelInvocationMessage {
    pub headers: Headers,
    pub invocation_id: String,
}

/// Sent by either side before closing the connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloseMessage {
    pub error: Option<String>,
    pub allow_reconnect: Option<bool>,
}

impl CloseMessage {
    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            allow_reconnect: Some(false),
        }
    }
}

/// Every message the hub protocol knows about.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(InvocationMessage),
    StreamInvocation(StreamInvocationMessage),
    StreamItem(StreamItemMessage),
    Completion(CompletionMessage),
    CancelInvocation(CancelInvocationMessage),
    Ping,
    Close(CloseMessage),
}

impl HubMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Invocation(_) => MessageType::Invocation,
            Self::StreamInvocation(_) => MessageType::StreamInvocation,
            Self::StreamItem(_) => MessageType::StreamItem,
            Self::Completion(_) => MessageType::Completion,
            Self::CancelInvocation(_) => MessageType::CancelInvocation,
            Self::Ping => MessageType::Ping,
            Self::Close(_) => MessageType::Close,
        }
    }

    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Self::Invocation(m) => m.invocation_id.as_deref(),
            Self::StreamInvocation(m) => Some(&m.invocation_id),
            Self::StreamItem(m) => Some(&m.invocation_id),
            Self::Completion(m) => Some(&m.invocation_id),
            Self::CancelInvocation(m) => Some(&m.invocation_id),
            Self::Ping | Self::Close(_) => None,
        }
    }
}
