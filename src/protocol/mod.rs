// Hub wire protocol: length-prefixed framing, MessagePack hub messages and
// the JSON connection handshake.

pub mod framing;
pub mod handshake;
pub mod message;
pub mod msgpack;

pub use framing::FramingError;
pub use handshake::{HandshakeError, HandshakeRequest, HandshakeResponse};
pub use message::{
    CancelInvocationMessage, CloseMessage, CompletionKind, CompletionMessage, Headers,
    HubMessage, InvocationMessage, MessageType, StreamInvocationMessage, StreamItemMessage,
};
pub use msgpack::{MessagePackHubProtocol, ProtocolError};
