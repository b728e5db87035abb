//! Synchronous token service for sandboxed children.
//!
//! A sandboxed child cannot duplicate OS handles itself, so it asks the
//! parent over a dedicated blocking pipe. Each request is one round trip:
//!
//! ```text
//! request:  | size: u32 | message_id: u32 | payload: N x u64 |
//! response: | M x u64 |            (no header, M implied by the request)
//! ```
//!
//! `size` counts the header. Writes are atomic; reads are accumulated until
//! the declared size is satisfied. A response slot holding [`INVALID_HANDLE`]
//! means the parent refused the request as a whole.
//!
//! The service is an optional capability: brokers on platforms that do not
//! need it are built without one.

mod client;
mod server;

use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TransportError;
use crate::types::{PlatformHandle, Token};

pub use client::SyncChannelClient;
pub use server::{HandleDuplicator, IdentityDuplicator, TokenServer, TokenTable};

/// Size of the fixed request header.
pub const HEADER_SIZE: usize = 8;

/// Default largest batch of handles or tokens in one request.
pub const DEFAULT_MAX_HANDLES_PER_REQUEST: usize = 64;

/// Sentinel written in every response slot of a refused request.
///
/// `u64::MAX` is reserved: it is never a valid handle or token value. The
/// client reads it in any slot as a refusal, and the server refuses to
/// tokenize it or hand it back as a redeemed handle.
pub const INVALID_HANDLE: PlatformHandle = PlatformHandle(u64::MAX);

/// Result type for synchronous service calls.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors from the synchronous token service.
///
/// A failed call never produces tokens or handles, even if part of the
/// exchange succeeded on the wire.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("I/O error on sync channel: {0}")]
    Io(#[from] io::Error),

    #[error("Short write on sync channel: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Batch of {count} exceeds the limit of {max}")]
    TooManyHandles { count: usize, max: usize },

    #[error("Unknown sync message id {0}")]
    UnknownMessage(u32),

    #[error("Malformed sync message: {0}")]
    Malformed(String),

    #[error("Parent refused the request")]
    Rejected,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Requests understood by the token service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyncMessageId {
    HandleToToken = 0,
    TokenToHandle = 1,
    CreatePlatformChannelPair = 2,
}

impl TryFrom<u32> for SyncMessageId {
    type Error = SyncError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::HandleToToken),
            1 => Ok(Self::TokenToHandle),
            2 => Ok(Self::CreatePlatformChannelPair),
            other => Err(SyncError::UnknownMessage(other)),
        }
    }
}

/// Privileged operations a sandboxed child delegates to its parent.
pub trait SynchronousService: Send + Sync {
    /// Exchange handles for opaque tokens the parent can redeem.
    fn handle_to_token(&self, handles: &[PlatformHandle]) -> Result<Vec<Token>>;

    /// Redeem tokens for handles duplicated into this process.
    fn token_to_handle(&self, tokens: &[Token]) -> Result<Vec<PlatformHandle>>;

    /// Ask the parent for a connected `(server, client)` channel pair.
    fn create_channel_pair(&self) -> Result<(PlatformHandle, PlatformHandle)>;
}

/// Build a request frame: header followed by `values` as little-endian u64s.
pub(crate) fn encode_request(id: SyncMessageId, values: &[u64]) -> Bytes {
    let size = HEADER_SIZE + values.len() * 8;
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32_le(size as u32);
    buf.put_u32_le(id as u32);
    for value in values {
        buf.put_u64_le(*value);
    }
    buf.freeze()
}

/// Build a response body from little-endian u64s.
pub(crate) fn encode_values(values: &[u64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(values.len() * 8);
    for value in values {
        buf.put_u64_le(*value);
    }
    buf.freeze()
}

pub(crate) fn decode_values(mut bytes: &[u8]) -> Vec<u64> {
    let mut values = Vec::with_capacity(bytes.len() / 8);
    while bytes.remaining() >= 8 {
        values.push(bytes.get_u64_le());
    }
    values
}

/// Parse a request header into `(size, message_id)`.
pub(crate) fn decode_header(header: &[u8; HEADER_SIZE]) -> (u32, u32) {
    let mut buf = &header[..];
    (buf.get_u32_le(), buf.get_u32_le())
}

/// Fill `buf` completely, accumulating fragmented reads.
///
/// Returns `Ok(false)` if the stream ended cleanly before the first byte.
pub(crate) fn read_full<S: Read>(stream: &mut S, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {} of {} bytes", filled, buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
