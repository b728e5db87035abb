//! Test utilities and recording implementations.
//!
//! These implement the broker's collaborator traits in memory so the state
//! machines can be driven event by event and their side effects inspected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::{
    lock, ChannelEvent, ChannelFactory, ChannelId, EventSender, Frame, RoutedChannel,
};
use crate::endpoint::{EndpointRef, PipeEndpoint};
use crate::error::{EndpointError, TransportError};
use crate::messages::BrokerMessage;
use crate::types::{PlatformHandle, RouteId, BROKER_ROUTE_ID};

/// Endpoint that records every callback.
#[derive(Default)]
pub struct RecordingEndpoint {
    channel: Mutex<Option<Arc<dyn RoutedChannel>>>,
    channel_ids: Mutex<Vec<ChannelId>>,
    messages: Mutex<Vec<(RouteId, Frame)>>,
    errors: Mutex<Vec<EndpointError>>,
}

impl RecordingEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every channel this endpoint has been handed, in order.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        lock(&self.channel_ids).clone()
    }

    pub fn channel(&self) -> Option<Arc<dyn RoutedChannel>> {
        lock(&self.channel).clone()
    }

    pub fn messages(&self) -> Vec<(RouteId, Frame)> {
        lock(&self.messages).clone()
    }

    pub fn errors(&self) -> Vec<EndpointError> {
        lock(&self.errors).clone()
    }
}

impl PipeEndpoint for RecordingEndpoint {
    fn got_channel(&self, channel: Arc<dyn RoutedChannel>) {
        lock(&self.channel_ids).push(channel.id());
        *lock(&self.channel) = Some(channel);
    }

    fn on_message(&self, route: RouteId, frame: Frame) {
        lock(&self.messages).push((route, frame));
    }

    fn on_error(&self, error: EndpointError) {
        lock(&self.errors).push(error);
    }
}

/// Build an `EndpointRef` for a recording endpoint.
pub fn endpoint_ref(endpoint: &Arc<RecordingEndpoint>) -> EndpointRef {
    EndpointRef::from(endpoint.clone())
}

/// Channel that records writes and routes instead of moving bytes.
pub struct RecordingChannel {
    id: ChannelId,
    handle: PlatformHandle,
    events: EventSender,
    closed: AtomicBool,
    writes: Mutex<Vec<(RouteId, Frame)>>,
    routes: Mutex<HashMap<RouteId, EndpointRef>>,
}

impl RecordingChannel {
    pub fn handle(&self) -> PlatformHandle {
        self.handle
    }

    pub fn writes(&self) -> Vec<(RouteId, Frame)> {
        lock(&self.writes).clone()
    }

    /// Broker control messages written to this channel, decoded.
    pub fn sent_messages(&self) -> Vec<BrokerMessage> {
        lock(&self.writes)
            .iter()
            .filter(|(route, _)| *route == BROKER_ROUTE_ID)
            .filter_map(|(_, frame)| BrokerMessage::decode(frame).ok())
            .collect()
    }

    pub fn route(&self, route: RouteId) -> Option<EndpointRef> {
        lock(&self.routes).get(&route).cloned()
    }

    pub fn route_count(&self) -> usize {
        lock(&self.routes).len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl RoutedChannel for RecordingChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn add_route(&self, route: RouteId, endpoint: EndpointRef) -> Result<(), TransportError> {
        let mut routes = lock(&self.routes);
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        routes.insert(route, endpoint);
        Ok(())
    }

    fn remove_route(&self, route: RouteId) {
        lock(&self.routes).remove(&route);
    }

    fn write(&self, route: RouteId, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        lock(&self.writes).push((route, frame));
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let routes = std::mem::take(&mut *lock(&self.routes));
        for endpoint in routes.into_values() {
            endpoint.on_error(EndpointError::ReadShutdown);
        }
        let _ = self.events.send(ChannelEvent::Destroyed { channel: self.id });
    }
}

/// Factory that hands out `RecordingChannel`s and remembers them by handle.
pub struct RecordingFactory {
    next_handle: Mutex<u64>,
    opened: Mutex<Vec<Arc<RecordingChannel>>>,
    fail_create_pair: AtomicBool,
    open_closed: AtomicBool,
}

impl Default for RecordingFactory {
    fn default() -> Self {
        Self {
            next_handle: Mutex::new(0x1000),
            opened: Mutex::new(Vec::new()),
            fail_create_pair: AtomicBool::new(false),
            open_closed: AtomicBool::new(false),
        }
    }
}

impl RecordingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_create_pair(&self, fail: bool) {
        self.fail_create_pair.store(fail, Ordering::Release);
    }

    /// Hand out channels that are already shut down, so writes fail.
    pub fn set_open_closed(&self, closed: bool) {
        self.open_closed.store(closed, Ordering::Release);
    }

    /// Channels opened so far, in order.
    pub fn opened(&self) -> Vec<Arc<RecordingChannel>> {
        lock(&self.opened).clone()
    }

    pub fn by_handle(&self, handle: PlatformHandle) -> Option<Arc<RecordingChannel>> {
        lock(&self.opened)
            .iter()
            .find(|channel| channel.handle == handle)
            .cloned()
    }

    pub fn by_id(&self, id: ChannelId) -> Option<Arc<RecordingChannel>> {
        lock(&self.opened)
            .iter()
            .find(|channel| channel.id == id)
            .cloned()
    }
}

impl ChannelFactory for RecordingFactory {
    fn create_pair(&self) -> Result<(PlatformHandle, PlatformHandle), TransportError> {
        if self.fail_create_pair.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut next = lock(&self.next_handle);
        let pair = (PlatformHandle(*next), PlatformHandle(*next + 1));
        *next += 2;
        Ok(pair)
    }

    fn open(
        &self,
        handle: PlatformHandle,
        events: EventSender,
    ) -> Result<Arc<dyn RoutedChannel>, TransportError> {
        let channel = Arc::new(RecordingChannel {
            id: ChannelId::next(),
            handle,
            events,
            closed: AtomicBool::new(self.open_closed.load(Ordering::Acquire)),
            writes: Mutex::new(Vec::new()),
            routes: Mutex::new(HashMap::new()),
        });
        lock(&self.opened).push(channel.clone());
        Ok(channel)
    }
}
