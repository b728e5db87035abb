//! Error types for the broker and its collaborators.

use crate::channel::ChannelId;
use crate::sync::SyncError;
use crate::types::{PipeId, PlatformHandle, ProcessId};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors raised by the broker state machines.
///
/// Everything except `Transport` and `Sync` is fatal: it means trusted
/// parent/child code broke the protocol, and the runtime tears down the
/// connection that produced it.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Protocol violation on pipe {pipe_id}: {reason}")]
    ProtocolViolation { pipe_id: PipeId, reason: String },

    #[error("Unknown broker message type {0}")]
    UnknownMessage(u32),

    #[error("Unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("Malformed broker message: {0}")]
    Decode(String),

    #[error("Endpoint on pipe {0} is not connected")]
    NotConnected(PipeId),

    #[error("Control message from untrusted channel {0}")]
    UntrustedControl(ChannelId),

    #[error("A channel to process {0} already exists")]
    DuplicateChannel(ProcessId),

    #[error("No child process {0} is registered")]
    UnknownProcess(ProcessId),

    #[error("Async send queue overflowed ({0} messages queued before bootstrap)")]
    QueueOverflow(usize),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Synchronous channel error: {0}")]
    Sync(#[from] SyncError),

    #[error("Broker has shut down")]
    Shutdown,
}

impl BrokerError {
    /// Whether the connection that produced this error must be torn down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Transport(_) | Self::Sync(_))
    }
}

/// Errors reported asynchronously to a pipe endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// The process holding the other end went away before or during the handshake.
    #[error("Peer process is unreachable")]
    PeerUnreachable,

    /// The channel carrying the pipe shut down.
    #[error("Read side shut down")]
    ReadShutdown,
}

/// Errors raised by routed channel implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Channel is closed")]
    Closed,

    #[error("Unknown transport handle {0}")]
    UnknownHandle(PlatformHandle),
}
