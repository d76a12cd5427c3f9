//! Connection handshake.
//!
//! Before any hub message, the client sends a JSON record naming the protocol
//! it wants, terminated by the ASCII record separator (`0x1E`). The server
//! answers with `{}` or `{"error": "..."}`, terminated the same way.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::msgpack::{PROTOCOL_NAME, PROTOCOL_VERSION};

/// Terminates every handshake record.
pub const RECORD_SEPARATOR: u8 = 0x1e;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl HandshakeRequest {
    /// Request for the MessagePack protocol this crate implements.
    pub fn messagepack() -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
        }
    }

    /// Check the requested protocol against what the hub speaks.
    pub fn validate(&self) -> Result<(), HandshakeError> {
        if self.protocol != PROTOCOL_NAME {
            return Err(HandshakeError::UnsupportedProtocol(self.protocol.clone()));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(HandshakeError::UnsupportedVersion {
                protocol: self.protocol.clone(),
                version: self.version,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
        }
    }

    /// Client side: `Err(Rejected)` if the server refused the handshake.
    pub fn into_result(self) -> Result<(), HandshakeError> {
        match self.error {
            Some(error) => Err(HandshakeError::Rejected(error)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed handshake record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("The protocol '{0}' is not supported.")]
    UnsupportedProtocol(String),

    #[error("The server does not support version {version} of the '{protocol}' protocol.")]
    UnsupportedVersion { protocol: String, version: u32 },

    #[error("Handshake was rejected by the server: {0}")]
    Rejected(String),
}

/// Parse a handshake request from the front of `buffer`.
///
/// Returns `Ok(None)` until the record separator has arrived; otherwise the
/// request and the number of bytes consumed, separator included.
pub fn parse_request(buffer: &[u8]) -> Result<Option<(HandshakeRequest, usize)>, HandshakeError> {
    parse_record(buffer)
}

/// Parse a handshake response from the front of `buffer`.
pub fn parse_response(
    buffer: &[u8],
) -> Result<Option<(HandshakeResponse, usize)>, HandshakeError> {
    parse_record(buffer)
}

pub fn write_request(request: &HandshakeRequest) -> Result<Vec<u8>, HandshakeError> {
    write_record(request)
}

pub fn write_response(response: &HandshakeResponse) -> Result<Vec<u8>, HandshakeError> {
    write_record(response)
}

fn parse_record<T: serde::de::DeserializeOwned>(
    buffer: &[u8],
) -> Result<Option<(T, usize)>, HandshakeError> {
    let Some(end) = buffer.iter().position(|&b| b == RECORD_SEPARATOR) else {
        return Ok(None);
    };
    let record = serde_json::from_slice(&buffer[..end])?;
    Ok(Some((record, end + 1)))
}

fn write_record<T: Serialize>(record: &T) -> Result<Vec<u8>, HandshakeError> {
    let mut out = serde_json::to_vec(record)?;
    out.push(RECORD_SEPARATOR);
    Ok(out)
}
