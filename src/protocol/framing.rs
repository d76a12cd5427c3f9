//! Length-prefixed binary message framing.
//!
//! Every hub message on the wire is preceded by its payload length encoded as a
//! variable-length quantity: 7 data bits per byte, least significant group
//! first, high bit set when another prefix byte follows. At most 5 prefix bytes
//! are read, and the 5th byte may only carry the top 3 bits of a 31-bit size,
//! which caps a single message at 2GB.
//!
//! ```
//! use auction_hub::protocol::framing;
//!
//! let mut wire = framing::write(b"first").to_vec();
//! wire.extend_from_slice(&framing::write(b""));
//!
//! let payloads = framing::parse(&wire).unwrap();
//! assert_eq!(payloads, vec![&b"first"[..], &b""[..]]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum number of bytes in a length prefix.
pub const MAX_LENGTH_PREFIX_SIZE: usize = 5;

/// Largest value the 5th prefix byte may hold (top 3 bits of a 31-bit size).
const MAX_LAST_PREFIX_BYTE: u8 = 0x07;

/// Errors raised while splitting a buffer into framed payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Prefix ran past the buffer or past the 5-byte limit.
    #[error("incomplete prefix")]
    IncompletePrefix,

    /// Prefix declared more bytes than the buffer holds.
    #[error("incomplete message")]
    IncompleteMessage,

    /// Prefix encodes a size of 2GB or more.
    #[error("message too large")]
    MessageTooLarge,
}

/// Frame a single payload: `prefix ++ payload`.
pub fn write(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(MAX_LENGTH_PREFIX_SIZE + payload.len());
    write_into(payload, &mut out);
    out.freeze()
}

/// Append a framed payload to `out`.
///
/// Used when several messages are batched into one transport frame.
pub fn write_into(payload: &[u8], out: &mut BytesMut) {
    out.reserve(MAX_LENGTH_PREFIX_SIZE + payload.len());

    let mut size = payload.len();
    loop {
        let mut part = (size & 0x7f) as u8;
        size >>= 7;
        if size > 0 {
            part |= 0x80;
        }
        out.put_u8(part);
        if size == 0 {
            break;
        }
    }

    out.extend_from_slice(payload);
}

/// Split `buffer` into complete payloads, in order.
///
/// Fails on the first malformed frame; frames before it are discarded.
pub fn parse(buffer: &[u8]) -> Result<Vec<&[u8]>, FramingError> {
    FrameIter::new(buffer).collect()
}

/// Lazy iterator over the framed payloads of one buffer.
///
/// Yields borrowed payload slices. After the first error the iterator is
/// exhausted; it never tries to resynchronize.
#[derive(Debug)]
pub struct FrameIter<'a> {
    buffer: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> FrameIter<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            offset: 0,
            failed: false,
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.offset
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<&'a [u8], FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buffer.len() {
            return None;
        }

        match read_frame(&self.buffer[self.offset..]) {
            Ok((payload, consumed)) => {
                self.offset += consumed;
                Some(Ok(payload))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Read one frame from the start of `input`.
///
/// Returns the payload and the total number of bytes consumed (prefix + payload).
fn read_frame(input: &[u8]) -> Result<(&[u8], usize), FramingError> {
    let (size, prefix_len) = read_prefix(input)?;

    let available = input.len() - prefix_len;
    if size > available {
        return Err(FramingError::IncompleteMessage);
    }

    let end = prefix_len + size;
    Ok((&input[prefix_len..end], end))
}

/// Decode the VLQ length prefix at the start of `input`.
fn read_prefix(input: &[u8]) -> Result<(usize, usize), FramingError> {
    let max_bytes = MAX_LENGTH_PREFIX_SIZE.min(input.len());
    let mut size: u64 = 0;

    for (index, &byte) in input.iter().take(max_bytes).enumerate() {
        size |= u64::from(byte & 0x7f) << (index * 7);

        if byte & 0x80 == 0 {
            let prefix_len = index + 1;
            if prefix_len == MAX_LENGTH_PREFIX_SIZE && byte > MAX_LAST_PREFIX_BYTE {
                return Err(FramingError::MessageTooLarge);
            }
            let size = usize::try_from(size).map_err(|_| FramingError::MessageTooLarge)?;
            return Ok((size, prefix_len));
        }
    }

    Err(FramingError::IncompletePrefix)
}
