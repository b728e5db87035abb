//! Parent-side proxy for one child process.

use std::sync::Arc;

use tracing::debug;

use crate::channel::RoutedChannel;
use crate::error::Result;
use crate::messages::BrokerMessage;
use crate::types::{PipeId, PlatformHandle, ProcessId, BROKER_ROUTE_ID};

/// Owns the routed channel to one child and speaks the parent half of the
/// broker protocol on it.
pub struct ChildBrokerHost {
    process_id: ProcessId,
    channel: Arc<dyn RoutedChannel>,
}

impl ChildBrokerHost {
    pub(crate) fn new(process_id: ProcessId, channel: Arc<dyn RoutedChannel>) -> Self {
        Self {
            process_id,
            channel,
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn channel(&self) -> &Arc<dyn RoutedChannel> {
        &self.channel
    }

    /// Tell the child to open a direct channel to `process_id` over `handle`.
    pub fn connect_to_process(&self, process_id: ProcessId, handle: PlatformHandle) -> Result<()> {
        debug!(child = %self.process_id, peer = %process_id, "Sending CONNECT_TO_PROCESS");
        self.send(BrokerMessage::ConnectToProcess { process_id, handle })
    }

    /// Tell the child that the peer of `pipe_id` lives in `process_id`
    /// (`0` for the parent itself).
    pub fn connect_message_pipe(&self, pipe_id: PipeId, process_id: ProcessId) -> Result<()> {
        debug!(child = %self.process_id, %pipe_id, peer = %process_id, "Sending PEER_PIPE_CONNECTED");
        self.send(BrokerMessage::PeerPipeConnected {
            pipe_id,
            process_id,
        })
    }

    fn send(&self, message: BrokerMessage) -> Result<()> {
        self.channel.write(BROKER_ROUTE_ID, message.encode())?;
        Ok(())
    }
}
