//! Child-side broker.
//!
//! One per child process. Owns the bootstrap channel to the parent, the
//! pending and connected pipe tables, and the channels to sibling processes.
//!
//! ```text
//!   endpoint X ──connect(p)──▶ ChildBroker ──CONNECT(p)──▶ parent
//!                                  ▲                          │
//!                                  └──PEER_PIPE_CONNECTED(p,q)┘
//!                                  │
//!                     attach X to channel for q, route p
//! ```
//!
//! The broker is driven from a single I/O task (see `runtime`). Every method
//! takes `&mut self`; there is no interior locking.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::channel::{ChannelEvent, ChannelFactory, ChannelId, EventSender, Frame, RoutedChannel};
use crate::config::BrokerConfig;
use crate::endpoint::EndpointRef;
use crate::error::{BrokerError, EndpointError, Result};
use crate::messages::BrokerMessage;
use crate::queue::{AsyncSendQueue, RecentPipes};
use crate::sync::SynchronousService;
use crate::types::{PipeId, PlatformHandle, ProcessId, BROKER_ROUTE_ID, PARENT_PROCESS_ID};

/// State of the bootstrap channel to the parent.
enum ParentLink {
    /// Broker exists, bootstrap handle not delivered yet.
    Pending,
    Connected(Arc<dyn RoutedChannel>),
    /// The parent channel was destroyed. Nothing can be routed any more.
    Lost,
}

/// The two halves of the in-process shortcut channel.
struct InProcessPair {
    first: Arc<dyn RoutedChannel>,
    second: Arc<dyn RoutedChannel>,
}

/// Per-process broker on the child side.
pub struct ChildBroker {
    factory: Arc<dyn ChannelFactory>,
    events: EventSender,
    sync: Option<Arc<dyn SynchronousService>>,
    parent: ParentLink,
    queue: AsyncSendQueue,
    /// Pipes we asked the parent to route, awaiting the peer's location.
    pending_connects: HashMap<PipeId, EndpointRef>,
    /// Second local endpoints that arrived before the parent channel existed.
    pending_in_process: Vec<(PipeId, EndpointRef)>,
    /// Pipes resolved locally after a cancel; a late resolution is stale.
    locally_resolved: RecentPipes<()>,
    connected: HashMap<EndpointRef, Arc<dyn RoutedChannel>>,
    channels: HashMap<ProcessId, Arc<dyn RoutedChannel>>,
    in_process_pair: Option<InProcessPair>,
}

impl ChildBroker {
    /// Create a broker that has no parent channel yet.
    ///
    /// `events` is the sending half of this broker's I/O queue; every channel
    /// the broker opens reports into it. `sync` is present only in sandboxed
    /// mode.
    pub fn new(
        config: &BrokerConfig,
        factory: Arc<dyn ChannelFactory>,
        events: EventSender,
        sync: Option<Arc<dyn SynchronousService>>,
    ) -> Self {
        Self {
            factory,
            events,
            sync,
            parent: ParentLink::Pending,
            queue: AsyncSendQueue::new(config.max_queued_messages),
            pending_connects: HashMap::new(),
            pending_in_process: Vec::new(),
            locally_resolved: RecentPipes::new(config.max_stale_pipes),
            connected: HashMap::new(),
            channels: HashMap::new(),
            in_process_pair: None,
        }
    }

    /// Wire up the bootstrap channel. Must be called exactly once.
    ///
    /// Drains the async send queue in order, then replays the in-process
    /// connects that were staged while the channel did not exist. If the
    /// channel fails during the drain the parent counts as lost.
    pub fn set_host_handle(&mut self, handle: PlatformHandle) -> Result<()> {
        if !matches!(self.parent, ParentLink::Pending) {
            return Err(BrokerError::DuplicateChannel(PARENT_PROCESS_ID));
        }
        let channel = self.factory.open(handle, self.events.clone())?;
        info!(
            channel = %channel.id(),
            queued = self.queue.len(),
            staged = self.pending_in_process.len(),
            "Parent channel ready"
        );

        let queued: Vec<BrokerMessage> = self.queue.drain().collect();
        for (sent, message) in queued.iter().enumerate() {
            debug!(message = message.name(), "Flushing queued broker message");
            if let Err(e) = channel.write(BROKER_ROUTE_ID, message.encode()) {
                error!(
                    channel = %channel.id(),
                    sent,
                    unsent = queued.len() - sent,
                    error = %e,
                    "Parent channel failed while flushing queue"
                );
                channel.close();
                self.lose_parent();
                return Err(e.into());
            }
        }
        self.parent = ParentLink::Connected(channel);

        for (pipe_id, endpoint) in std::mem::take(&mut self.pending_in_process) {
            self.connect(pipe_id, endpoint)?;
        }
        Ok(())
    }

    /// Ask for `pipe_id` to be connected to its peer, wherever it lives.
    ///
    /// Never reports failure to the caller directly; errors reach the
    /// endpoint through `on_error`. An `Err` here is a protocol violation.
    pub fn connect(&mut self, pipe_id: PipeId, endpoint: EndpointRef) -> Result<()> {
        if pipe_id.is_reserved() {
            return Err(BrokerError::ProtocolViolation {
                pipe_id,
                reason: "pipe id is reserved for broker control".to_string(),
            });
        }
        if matches!(self.parent, ParentLink::Lost) {
            warn!(%pipe_id, "Connect after parent channel loss");
            endpoint.on_error(EndpointError::PeerUnreachable);
            return Ok(());
        }

        let Some(sibling) = self.pending_connects.get(&pipe_id).cloned() else {
            debug!(%pipe_id, "Requesting pipe route from parent");
            self.pending_connects.insert(pipe_id, endpoint);
            return self.write_async(BrokerMessage::ConnectMessagePipe { pipe_id });
        };

        if sibling == endpoint {
            return Err(BrokerError::ProtocolViolation {
                pipe_id,
                reason: "endpoint connected twice".to_string(),
            });
        }

        if matches!(self.parent, ParentLink::Pending) {
            if self.pending_in_process.iter().any(|(id, _)| *id == pipe_id) {
                return Err(BrokerError::ProtocolViolation {
                    pipe_id,
                    reason: "third local endpoint for pipe".to_string(),
                });
            }
            debug!(%pipe_id, "Staging in-process connect until parent channel exists");
            self.pending_in_process.push((pipe_id, endpoint));
            return Ok(());
        }

        // Both ends live here. Retract the upstream request and short-circuit.
        self.pending_connects.remove(&pipe_id);
        if let Some(evicted) = self.locally_resolved.insert(pipe_id, ()) {
            debug!(pipe_id = %evicted, "Forgetting oldest locally resolved pipe");
        }
        self.write_async(BrokerMessage::CancelConnectMessagePipe { pipe_id })?;

        let (first, second) = match self.in_process_pair() {
            Ok(pair) => pair,
            Err(e) => {
                error!(%pipe_id, error = %e, "Couldn't create in-process channel pair");
                sibling.on_error(EndpointError::PeerUnreachable);
                endpoint.on_error(EndpointError::PeerUnreachable);
                return Err(e);
            }
        };
        self.attach(pipe_id, sibling, first)?;
        self.attach(pipe_id, endpoint, second)?;
        debug!(%pipe_id, "Connected sibling endpoints in-process");
        Ok(())
    }

    /// Detach a connected endpoint from its channel.
    ///
    /// Closing either end of a locally resolved pipe forgets its resolution.
    pub fn close(&mut self, pipe_id: PipeId, endpoint: &EndpointRef) -> Result<()> {
        let channel = self
            .connected
            .remove(endpoint)
            .ok_or(BrokerError::NotConnected(pipe_id))?;
        channel.remove_route(pipe_id.route());
        self.locally_resolved.remove(&pipe_id);
        debug!(%pipe_id, channel = %channel.id(), "Closed pipe");
        Ok(())
    }

    /// Apply one event from the I/O queue.
    pub fn handle_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Message { channel, frame } => self.on_message(channel, &frame),
            ChannelEvent::Destroyed { channel } => {
                self.channel_destroyed(channel);
                Ok(())
            }
        }
    }

    fn on_message(&mut self, channel: ChannelId, frame: &Frame) -> Result<()> {
        if self.parent_channel().map(|p| p.id()) != Some(channel) {
            return Err(BrokerError::UntrustedControl(channel));
        }
        match BrokerMessage::decode(frame)? {
            BrokerMessage::ConnectToProcess { process_id, handle } => {
                self.on_connect_to_process(process_id, handle)
            }
            BrokerMessage::PeerPipeConnected {
                pipe_id,
                process_id,
            } => self.on_peer_pipe_connected(pipe_id, process_id),
            message @ (BrokerMessage::ConnectMessagePipe { .. }
            | BrokerMessage::CancelConnectMessagePipe { .. }) => {
                Err(BrokerError::UnexpectedMessage(message.name()))
            }
        }
    }

    fn on_connect_to_process(&mut self, process_id: ProcessId, handle: PlatformHandle) -> Result<()> {
        if self.channels.contains_key(&process_id) {
            return Err(BrokerError::DuplicateChannel(process_id));
        }
        let channel = self.factory.open(handle, self.events.clone())?;
        info!(%process_id, channel = %channel.id(), "Connected to peer process");
        self.channels.insert(process_id, channel);
        Ok(())
    }

    fn on_peer_pipe_connected(&mut self, pipe_id: PipeId, process_id: ProcessId) -> Result<()> {
        let Some(endpoint) = self.pending_connects.remove(&pipe_id) else {
            if self.locally_resolved.remove(&pipe_id).is_some() {
                warn!(%pipe_id, "Discarding stale resolution for locally connected pipe");
                return Ok(());
            }
            return Err(BrokerError::ProtocolViolation {
                pipe_id,
                reason: "resolution for a pipe that is not pending".to_string(),
            });
        };

        let channel = if process_id.is_parent() {
            self.parent_channel().cloned()
        } else {
            self.channels.get(&process_id).cloned()
        };
        match channel {
            Some(channel) => {
                debug!(%pipe_id, %process_id, "Pipe peer resolved");
                self.attach(pipe_id, endpoint, channel)?;
                Ok(())
            }
            None => {
                // The peer died before the parent's reply reached us.
                warn!(%pipe_id, %process_id, "Pipe peer unreachable");
                endpoint.on_error(EndpointError::PeerUnreachable);
                Ok(())
            }
        }
    }

    /// Purge every table that references `channel`. Safe to call repeatedly.
    fn channel_destroyed(&mut self, channel: ChannelId) {
        if self.parent_channel().map(|p| p.id()) == Some(channel) {
            error!(%channel, pending = self.pending_connects.len(), "Parent channel lost");
            self.lose_parent();
        }

        let before = self.channels.len();
        self.channels.retain(|process_id, c| {
            let keep = c.id() != channel;
            if !keep {
                info!(%process_id, %channel, "Peer process channel destroyed");
            }
            keep
        });
        // The channel's own close reported ReadShutdown to these endpoints.
        self.connected.retain(|_, c| c.id() != channel);

        if let Some(pair) = &self.in_process_pair {
            if pair.first.id() == channel || pair.second.id() == channel {
                debug!(%channel, "In-process channel pair destroyed");
                self.in_process_pair = None;
            }
        }

        if before == self.channels.len() {
            debug!(%channel, "Channel destroyed");
        }
    }

    /// Close whichever owned channel has id `channel`.
    ///
    /// Used after a fatal error on that channel. The purge happens when its
    /// `Destroyed` event comes back through the queue.
    pub fn disconnect(&mut self, channel: ChannelId) {
        let target = self
            .parent_channel()
            .into_iter()
            .chain(self.channels.values())
            .chain(self.connected.values())
            .find(|c| c.id() == channel)
            .cloned();
        if let Some(target) = target {
            warn!(%channel, "Closing channel after fatal error");
            target.close();
        }
    }

    /// Route `pipe_id` on `channel` to `endpoint`.
    ///
    /// Returns `false` when the channel was already closed. Its `Destroyed`
    /// event may still be queued, so the endpoint is failed here instead.
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

    /// Mark the parent gone and fail every endpoint still waiting on it.
    fn lose_parent(&mut self) {
        self.parent = ParentLink::Lost;
        for (pipe_id, endpoint) in self
            .pending_connects
            .drain()
            .chain(self.pending_in_process.drain(..))
        {
            debug!(%pipe_id, "Failing pending connect after parent loss");
            endpoint.on_error(EndpointError::PeerUnreachable);
        }
    }

    fn write_async(&mut self, message: BrokerMessage) -> Result<()> {
        match &self.parent {
            ParentLink::Connected(channel) => {
                channel.write(BROKER_ROUTE_ID, message.encode())?;
                Ok(())
            }
            ParentLink::Pending => {
                debug!(message = message.name(), "Queueing broker message until parent channel exists");
                self.queue.push(message)
            }
            ParentLink::Lost => {
                debug!(message = message.name(), "Dropping broker message, parent channel lost");
                Ok(())
            }
        }
    }

    /// The shortcut pair, created on first use and kept for the broker's life.
    fn in_process_pair(&mut self) -> Result<(Arc<dyn RoutedChannel>, Arc<dyn RoutedChannel>)> {
        if let Some(pair) = &self.in_process_pair {
            return Ok((pair.first.clone(), pair.second.clone()));
        }
        let (server, client) = match &self.sync {
            Some(sync) => sync.create_channel_pair()?,
            None => self.factory.create_pair()?,
        };
        let first = self.factory.open(server, self.events.clone())?;
        let second = self.factory.open(client, self.events.clone())?;
        info!(first = %first.id(), second = %second.id(), "Created in-process channel pair");
        self.in_process_pair = Some(InProcessPair {
            first: first.clone(),
            second: second.clone(),
        });
        Ok((first, second))
    }

    fn parent_channel(&self) -> Option<&Arc<dyn RoutedChannel>> {
        match &self.parent {
            ParentLink::Connected(channel) => Some(channel),
            _ => None,
        }
    }

    /// Capability check for dependent code; `None` outside sandboxed mode.
    pub fn sync_service(&self) -> Option<&Arc<dyn SynchronousService>> {
        self.sync.as_ref()
    }

    pub fn is_pending(&self, pipe_id: PipeId) -> bool {
        self.pending_connects.contains_key(&pipe_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_connects.len()
    }

    pub fn is_connected(&self, endpoint: &EndpointRef) -> bool {
        self.connected.contains_key(endpoint)
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn has_channel_to(&self, process_id: ProcessId) -> bool {
        self.channels.contains_key(&process_id)
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    pub fn locally_resolved_count(&self) -> usize {
        self.locally_resolved.len()
    }

    pub fn parent_lost(&self) -> bool {
        matches!(self.parent, ParentLink::Lost)
    }
}
