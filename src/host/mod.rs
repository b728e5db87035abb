//! Parent-side broker.
//!
//! The parent keeps one [`ChildBrokerHost`] per launched child and a single
//! table of pending connects shared by all of them. Two connect requests
//! for the same pipe id from different processes are matched here, and each
//! side is told where the other lives.
//!
//! ```text
//!   child 7 ──CONNECT(100)──▶ ┌────────────┐ ◀──CONNECT(100)── child 9
//!                             │ HostBroker │
//!   child 7 ◀─PEER(100, 9)─── └────────────┘ ───PEER(100, 7)─▶ child 9
//! ```
//!
//! The parent can own pipe endpoints too; they take part in the same table
//! as process `0`.

mod child_host;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelFactory, ChannelId, EventSender, RoutedChannel};
use crate::config::BrokerConfig;
use crate::endpoint::EndpointRef;
use crate::error::{BrokerError, EndpointError, Result};
use crate::messages::BrokerMessage;
use crate::queue::RecentPipes;
use crate::types::{PipeId, PlatformHandle, ProcessId, PARENT_PROCESS_ID};

pub use child_host::ChildBrokerHost;

/// Who is waiting for a peer on a pending pipe id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOwner {
    Child(ProcessId),
    Parent(EndpointRef),
}

/// Parent-wide broker state.
pub struct HostBroker {
    factory: Arc<dyn ChannelFactory>,
    events: EventSender,
    /// Channel registry: one host per live child.
    hosts: HashMap<ProcessId, ChildBrokerHost>,
    by_channel: HashMap<ChannelId, ProcessId>,
    pending: HashMap<PipeId, PendingOwner>,
    /// Pending connects whose owner died before its peer asked. Oldest
    /// are forgotten once the table is full.
    tombstones: RecentPipes<ProcessId>,
    /// Child pairs that already hold a direct channel to each other.
    linked: HashSet<(ProcessId, ProcessId)>,
    /// Endpoints living in the parent, by the channel carrying them.
    connected: HashMap<EndpointRef, Arc<dyn RoutedChannel>>,
    in_process_pair: Option<(Arc<dyn RoutedChannel>, Arc<dyn RoutedChannel>)>,
}

impl HostBroker {
    pub fn new(config: &BrokerConfig, factory: Arc<dyn ChannelFactory>, events: EventSender) -> Self {
        Self {
            factory,
            events,
            hosts: HashMap::new(),
            by_channel: HashMap::new(),
            pending: HashMap::new(),
            tombstones: RecentPipes::new(config.max_stale_pipes),
            linked: HashSet::new(),
            connected: HashMap::new(),
            in_process_pair: None,
        }
    }

    /// Register a freshly launched child and open the channel to it.
    pub fn add_child(&mut self, process_id: ProcessId, handle: PlatformHandle) -> Result<()> {
        if process_id == PARENT_PROCESS_ID || self.hosts.contains_key(&process_id) {
            return Err(BrokerError::DuplicateChannel(process_id));
        }
        let channel = self.factory.open(handle, self.events.clone())?;
        info!(%process_id, channel = %channel.id(), "Child registered");
        self.by_channel.insert(channel.id(), process_id);
        self.hosts
            .insert(process_id, ChildBrokerHost::new(process_id, channel));
        Ok(())
    }

    pub fn host(&self, process_id: ProcessId) -> Option<&ChildBrokerHost> {
        self.hosts.get(&process_id)
    }

    /// Apply one event from the parent's I/O queue.
    pub fn handle_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Message { channel, frame } => {
                let from = *self
                    .by_channel
                    .get(&channel)
                    .ok_or(BrokerError::UntrustedControl(channel))?;
                match BrokerMessage::decode(&frame)? {
                    BrokerMessage::ConnectMessagePipe { pipe_id } => {
                        self.request_pipe_connect(from, pipe_id)
                    }
                    BrokerMessage::CancelConnectMessagePipe { pipe_id } => {
                        self.cancel_connect(from, pipe_id);
                        Ok(())
                    }
                    message @ (BrokerMessage::PeerPipeConnected { .. }
                    | BrokerMessage::ConnectToProcess { .. }) => {
                        Err(BrokerError::UnexpectedMessage(message.name()))
                    }
                }
            }
            ChannelEvent::Destroyed { channel } => {
                self.channel_destroyed(channel);
                Ok(())
            }
        }
    }

    /// A child asked for `pipe_id` to be routed.
    pub fn request_pipe_connect(&mut self, from: ProcessId, pipe_id: PipeId) -> Result<()> {
        if pipe_id.is_reserved() {
            return Err(BrokerError::ProtocolViolation {
                pipe_id,
                reason: format!("process {} requested a reserved pipe id", from),
            });
        }
        if let Some(dead) = self.tombstones.remove(&pipe_id) {
            // The child resolves this as unreachable: it has no channel to `dead`.
            warn!(%pipe_id, %from, peer = %dead, "Pipe peer died before connecting");
            return self.host_for(from)?.connect_message_pipe(pipe_id, dead);
        }

        match self.pending.remove(&pipe_id) {
            None => {
                debug!(%pipe_id, %from, "Pipe pending, waiting for peer");
                self.pending.insert(pipe_id, PendingOwner::Child(from));
                Ok(())
            }
            Some(PendingOwner::Child(owner)) if owner == from => {
                self.pending.insert(pipe_id, PendingOwner::Child(owner));
                Err(BrokerError::ProtocolViolation {
                    pipe_id,
                    reason: format!("process {} requested the pipe twice", from),
                })
            }
            Some(PendingOwner::Child(owner)) => {
                self.ensure_linked(owner, from)?;
                info!(%pipe_id, first = %owner, second = %from, "Pipe matched between children");
                self.host_for(owner)?.connect_message_pipe(pipe_id, from)?;
                self.host_for(from)?.connect_message_pipe(pipe_id, owner)
            }
            Some(PendingOwner::Parent(endpoint)) => {
                let channel = self.host_for(from)?.channel().clone();
                info!(%pipe_id, child = %from, "Pipe matched between parent and child");
                if !self.attach(pipe_id, endpoint, channel)? {
                    return Ok(());
                }
                self.host_for(from)?
                    .connect_message_pipe(pipe_id, PARENT_PROCESS_ID)
            }
        }
    }

    /// A child resolved `pipe_id` locally. Only the child's own entry is removed.
    pub fn cancel_connect(&mut self, from: ProcessId, pipe_id: PipeId) {
        match self.pending.get(&pipe_id) {
            Some(PendingOwner::Child(owner)) if *owner == from => {
                debug!(%pipe_id, %from, "Pending connect cancelled");
                self.pending.remove(&pipe_id);
            }
            _ => debug!(%pipe_id, %from, "Cancel for pipe not pending from this child"),
        }
    }

    /// Connect a pipe endpoint that lives in the parent.
    pub fn connect(&mut self, pipe_id: PipeId, endpoint: EndpointRef) -> Result<()> {
        if pipe_id.is_reserved() {
            return Err(BrokerError::ProtocolViolation {
                pipe_id,
                reason: "pipe id is reserved for broker control".to_string(),
            });
        }
        if let Some(dead) = self.tombstones.remove(&pipe_id) {
            warn!(%pipe_id, peer = %dead, "Pipe peer died before connecting");
            endpoint.on_error(EndpointError::PeerUnreachable);
            return Ok(());
        }

        match self.pending.remove(&pipe_id) {
            None => {
                debug!(%pipe_id, "Parent pipe pending, waiting for peer");
                self.pending.insert(pipe_id, PendingOwner::Parent(endpoint));
                Ok(())
            }
            Some(PendingOwner::Parent(sibling)) if sibling == endpoint => {
                self.pending.insert(pipe_id, PendingOwner::Parent(sibling));
                Err(BrokerError::ProtocolViolation {
                    pipe_id,
                    reason: "endpoint connected twice".to_string(),
                })
            }
            Some(PendingOwner::Parent(sibling)) => {
                let (first, second) = self.in_process_pair()?;
                self.attach(pipe_id, sibling, first)?;
                self.attach(pipe_id, endpoint, second)?;
                debug!(%pipe_id, "Connected parent endpoints in-process");
                Ok(())
            }
            Some(PendingOwner::Child(owner)) => {
                let channel = self.host_for(owner)?.channel().clone();
                info!(%pipe_id, child = %owner, "Pipe matched between child and parent");
                if !self.attach(pipe_id, endpoint, channel)? {
                    return Ok(());
                }
                self.host_for(owner)?
                    .connect_message_pipe(pipe_id, PARENT_PROCESS_ID)
            }
        }
    }

    /// Detach a connected parent endpoint from its channel.
    pub fn close(&mut self, pipe_id: PipeId, endpoint: &EndpointRef) -> Result<()> {
        let channel = self
            .connected
            .remove(endpoint)
            .ok_or(BrokerError::NotConnected(pipe_id))?;
        channel.remove_route(pipe_id.route());
        Ok(())
    }

    /// Purge everything that referenced `channel`. Safe to call repeatedly.
    fn channel_destroyed(&mut self, channel: ChannelId) {
        // The channel's own close reported ReadShutdown to these endpoints.
        self.connected.retain(|_, c| c.id() != channel);
        if let Some((first, second)) = &self.in_process_pair {
            if first.id() == channel || second.id() == channel {
                self.in_process_pair = None;
            }
        }

        let Some(process_id) = self.by_channel.remove(&channel) else {
            debug!(%channel, "Channel destroyed");
            return;
        };
        self.hosts.remove(&process_id);
        self.linked
            .retain(|(a, b)| *a != process_id && *b != process_id);

        let orphaned: Vec<PipeId> = self
            .pending
            .iter()
            .filter(|(_, owner)| **owner == PendingOwner::Child(process_id))
            .map(|(pipe_id, _)| *pipe_id)
            .collect();
        for pipe_id in &orphaned {
            self.pending.remove(pipe_id);
            if let Some(evicted) = self.tombstones.insert(*pipe_id, process_id) {
                debug!(pipe_id = %evicted, "Forgetting oldest tombstone");
            }
        }

        info!(
            %process_id,
            %channel,
            orphaned = orphaned.len(),
            "Child channel destroyed"
        );
    }

    /// Close the channel with id `channel` after a fatal error on it.
    pub fn disconnect(&mut self, channel: ChannelId) {
        let target = self
            .by_channel
            .get(&channel)
            .and_then(|process_id| self.hosts.get(process_id))
            .map(|host| host.channel().clone())
            .or_else(|| {
                self.connected
                    .values()
                    .find(|c| c.id() == channel)
                    .cloned()
            });
        if let Some(target) = target {
            warn!(%channel, "Closing channel after fatal error");
            target.close();
        }
    }

    /// Give two children a direct channel unless they already share one.
    fn ensure_linked(&mut self, a: ProcessId, b: ProcessId) -> Result<()> {
        let key = if a < b { (a, b) } else { (b, a) };
        if self.linked.contains(&key) {
            return Ok(());
        }
        let (first, second) = self.factory.create_pair()?;
        self.host_for(a)?.connect_to_process(b, first)?;
        self.host_for(b)?.connect_to_process(a, second)?;
        debug!(%a, %b, "Linked child processes");
        self.linked.insert(key);
        Ok(())
    }

    /// Route `pipe_id` on `channel` to a parent endpoint. Returns `false`
    /// and fails the endpoint when the channel is already closed.
    fn attach(
        &mut self,
        pipe_id: PipeId,
        endpoint: EndpointRef,
        channel: Arc<dyn RoutedChannel>,
    ) -> Result<bool> {
        if self.connected.contains_key(&endpoint) {
            return Err(BrokerError::ProtocolViolation {
                pipe_id,
                reason: "endpoint already attached to a channel".to_string(),
            });
        }
        if let Err(e) = channel.add_route(pipe_id.route(), endpoint.clone()) {
            warn!(%pipe_id, channel = %channel.id(), error = %e, "Pipe channel closed before attach");
            endpoint.on_error(EndpointError::PeerUnreachable);
            return Ok(false);
        }
        self.connected.insert(endpoint.clone(), channel.clone());
        endpoint.got_channel(channel);
        Ok(true)
    }

    fn in_process_pair(&mut self) -> Result<(Arc<dyn RoutedChannel>, Arc<dyn RoutedChannel>)> {
        if let Some((first, second)) = &self.in_process_pair {
            return Ok((first.clone(), second.clone()));
        }
        let (server, client) = self.factory.create_pair()?;
        let first = self.factory.open(server, self.events.clone())?;
        let second = self.factory.open(client, self.events.clone())?;
        self.in_process_pair = Some((first.clone(), second.clone()));
        Ok((first, second))
    }

    fn host_for(&self, process_id: ProcessId) -> Result<&ChildBrokerHost> {
        self.hosts
            .get(&process_id)
            .ok_or(BrokerError::UnknownProcess(process_id))
    }

    pub fn child_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn pending_owner(&self, pipe_id: PipeId) -> Option<&PendingOwner> {
        self.pending.get(&pipe_id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn is_connected(&self, endpoint: &EndpointRef) -> bool {
        self.connected.contains_key(endpoint)
    }

    pub fn is_linked(&self, a: ProcessId, b: ProcessId) -> bool {
        let key = if a < b { (a, b) } else { (b, a) };
        self.linked.contains(&key)
    }

    /// Process id of the child on `channel`, if it is a registered child channel.
    pub fn process_for_channel(&self, channel: ChannelId) -> Option<ProcessId> {
        self.by_channel.get(&channel).copied()
    }
}
