//! Broker control messages.
//!
//! All of these travel on [`BROKER_ROUTE_ID`](crate::types::BROKER_ROUTE_ID).
//! Layout is little-endian: a `u32` message type followed by fixed fields.
//! `ConnectToProcess` additionally carries exactly one transferred handle
//! out of band in the frame's handle list.

use bytes::{Buf, BufMut, BytesMut};

use crate::channel::Frame;
use crate::error::{BrokerError, Result};
use crate::types::{PipeId, PlatformHandle, ProcessId};

const CONNECT_MESSAGE_PIPE: u32 = 0;
const CANCEL_CONNECT_MESSAGE_PIPE: u32 = 1;
const PEER_PIPE_CONNECTED: u32 = 2;
const CONNECT_TO_PROCESS: u32 = 3;

/// Control vocabulary exchanged between a child broker and its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerMessage {
    /// child -> parent: route this pipe for me.
    ConnectMessagePipe { pipe_id: PipeId },
    /// child -> parent: never mind, both ends turned out to be local.
    CancelConnectMessagePipe { pipe_id: PipeId },
    /// parent -> child: the peer of `pipe_id` lives in `process_id` (0 = parent).
    PeerPipeConnected { pipe_id: PipeId, process_id: ProcessId },
    /// parent -> child: open a direct channel to `process_id` over `handle`.
    ConnectToProcess {
        process_id: ProcessId,
        handle: PlatformHandle,
    },
}

impl BrokerMessage {
    fn message_type(&self) -> u32 {
        match self {
            Self::ConnectMessagePipe { .. } => CONNECT_MESSAGE_PIPE,
            Self::CancelConnectMessagePipe { .. } => CANCEL_CONNECT_MESSAGE_PIPE,
            Self::PeerPipeConnected { .. } => PEER_PIPE_CONNECTED,
            Self::ConnectToProcess { .. } => CONNECT_TO_PROCESS,
        }
    }

    /// Name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectMessagePipe { .. } => "CONNECT_MESSAGE_PIPE",
            Self::CancelConnectMessagePipe { .. } => "CANCEL_CONNECT_MESSAGE_PIPE",
            Self::PeerPipeConnected { .. } => "PEER_PIPE_CONNECTED",
            Self::ConnectToProcess { .. } => "CONNECT_TO_PROCESS",
        }
    }

    /// Serialize into a frame ready for `RoutedChannel::write`.
    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_u32_le(self.message_type());
        let mut handles = Vec::new();
        match self {
            Self::ConnectMessagePipe { pipe_id } | Self::CancelConnectMessagePipe { pipe_id } => {
                buf.put_u64_le(pipe_id.0);
            }
            Self::PeerPipeConnected {
                pipe_id,
                process_id,
            } => {
                buf.put_u64_le(pipe_id.0);
                buf.put_u64_le(process_id.0);
            }
            Self::ConnectToProcess { process_id, handle } => {
                buf.put_u64_le(process_id.0);
                handles.push(*handle);
            }
        }
        Frame::with_handles(buf.freeze(), handles)
    }

    /// Parse a frame received on the broker route.
    ///
    /// Unknown message types are fatal; there is no forward-compatible skip.
    pub fn decode(frame: &Frame) -> Result<Self> {
        let mut buf = &frame.payload[..];
        if buf.remaining() < 4 {
            return Err(BrokerError::Decode(format!(
                "frame of {} bytes has no message type",
                buf.remaining()
            )));
        }
        let message_type = buf.get_u32_le();

        let expected_handles = match message_type {
            CONNECT_TO_PROCESS => 1,
            CONNECT_MESSAGE_PIPE | CANCEL_CONNECT_MESSAGE_PIPE | PEER_PIPE_CONNECTED => 0,
            other => return Err(BrokerError::UnknownMessage(other)),
        };
        if frame.handles.len() != expected_handles {
            return Err(BrokerError::Decode(format!(
                "message type {} expects {} handles, got {}",
                message_type,
                expected_handles,
                frame.handles.len()
            )));
        }

        let body_len = match message_type {
            PEER_PIPE_CONNECTED => 16,
            _ => 8,
        };
        if buf.remaining() != body_len {
            return Err(BrokerError::Decode(format!(
                "message type {} expects {} payload bytes, got {}",
                message_type,
                body_len,
                buf.remaining()
            )));
        }

        let message = match message_type {
            CONNECT_MESSAGE_PIPE => Self::ConnectMessagePipe {
                pipe_id: PipeId(buf.get_u64_le()),
            },
            CANCEL_CONNECT_MESSAGE_PIPE => Self::CancelConnectMessagePipe {
                pipe_id: PipeId(buf.get_u64_le()),
            },
            PEER_PIPE_CONNECTED => Self::PeerPipeConnected {
                pipe_id: PipeId(buf.get_u64_le()),
                process_id: ProcessId(buf.get_u64_le()),
            },
            _ => Self::ConnectToProcess {
                process_id: ProcessId(buf.get_u64_le()),
                handle: frame.handles[0],
            },
        };
        Ok(message)
    }
}
