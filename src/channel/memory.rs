//! In-memory routed channels.
//!
//! Every handle minted by a `MemoryTransport` names one end of an in-memory
//! channel pair. Handles are plain keys into the transport's table, so they
//! can be carried inside broker messages exactly like OS handles. Clone the
//! transport to share one handle namespace between several brokers living in
//! the same process.
//!
//! Delivery is synchronous: `write` on one end runs the peer's endpoint
//! callback (or queues a broker event) before returning.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use super::{lock, ChannelEvent, ChannelFactory, ChannelId, EventSender, Frame, RoutedChannel};
use crate::endpoint::EndpointRef;
use crate::error::{EndpointError, TransportError};
use crate::types::{PlatformHandle, RouteId, BROKER_ROUTE_ID};

/// First handle value handed out, so small integers never look valid.
const FIRST_HANDLE: u64 = 0x100;

/// Factory for in-memory channel pairs.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<TransportState>>,
}

struct TransportState {
    next_handle: u64,
    /// Channel ends created but not yet opened by anyone.
    unclaimed: HashMap<PlatformHandle, Arc<MemoryChannel>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                next_handle: FIRST_HANDLE,
                unclaimed: HashMap::new(),
            })),
        }
    }

    /// Number of channel ends created but never opened.
    pub fn unclaimed_handles(&self) -> usize {
        lock(&self.state).unclaimed.len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelFactory for MemoryTransport {
    fn create_pair(&self) -> Result<(PlatformHandle, PlatformHandle), TransportError> {
        let first = Arc::new(MemoryChannel::new());
        let second = Arc::new(MemoryChannel::new());
        lock(&first.state).peer = Arc::downgrade(&second);
        lock(&second.state).peer = Arc::downgrade(&first);

        let mut state = lock(&self.state);
        let server = PlatformHandle(state.next_handle);
        let client = PlatformHandle(state.next_handle + 1);
        state.next_handle += 2;
        state.unclaimed.insert(server, first);
        state.unclaimed.insert(client, second);

        trace!(%server, %client, "Created memory channel pair");
        Ok((server, client))
    }

    fn open(
        &self,
        handle: PlatformHandle,
        events: EventSender,
    ) -> Result<Arc<dyn RoutedChannel>, TransportError> {
        let channel = lock(&self.state)
            .unclaimed
            .remove(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        channel.attach(events);
        debug!(%handle, channel = %channel.id, "Opened memory channel");
        Ok(channel)
    }
}

struct MemoryChannel {
    id: ChannelId,
    closed: AtomicBool,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    events: Option<EventSender>,
    routes: HashMap<RouteId, EndpointRef>,
    /// Frames that arrived before anyone listened on their route.
    pending: HashMap<RouteId, VecDeque<Frame>>,
    peer: Weak<MemoryChannel>,
}

enum Target {
    Broker(EventSender),
    Endpoint(EndpointRef),
}

impl MemoryChannel {
    fn new() -> Self {
        Self {
            id: ChannelId::next(),
            closed: AtomicBool::new(false),
            state: Mutex::new(ChannelState::default()),
        }
    }

    fn attach(&self, events: EventSender) {
        let backlog = {
            let mut state = lock(&self.state);
            state.events = Some(events.clone());
            state.pending.remove(&BROKER_ROUTE_ID).unwrap_or_default()
        };
        for frame in backlog {
            self.notify(&events, ChannelEvent::Message {
                channel: self.id,
                frame,
            });
        }
    }

    fn deliver(&self, route: RouteId, frame: Frame) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let target = {
            let mut state = lock(&self.state);
            let target = if route == BROKER_ROUTE_ID {
                state.events.clone().map(Target::Broker)
            } else {
                state.routes.get(&route).cloned().map(Target::Endpoint)
            };
            match target {
                Some(target) => target,
                None => {
                    state.pending.entry(route).or_default().push_back(frame);
                    return;
                }
            }
        };
        match target {
            Target::Broker(events) => self.notify(&events, ChannelEvent::Message {
                channel: self.id,
                frame,
            }),
            Target::Endpoint(endpoint) => endpoint.on_message(route, frame),
        }
    }

    fn notify(&self, events: &EventSender, event: ChannelEvent) {
        if events.send(event).is_err() {
            debug!(channel = %self.id, "Broker event queue closed, dropping event");
        }
    }
}

impl RoutedChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn add_route(&self, route: RouteId, endpoint: EndpointRef) -> Result<(), TransportError> {
        let backlog = {
            let mut state = lock(&self.state);
            // Checked under the lock: `close` takes the routes after setting the flag.
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            state.routes.insert(route, endpoint.clone());
            state.pending.remove(&route).unwrap_or_default()
        };
        for frame in backlog {
            endpoint.on_message(route, frame);
        }
        Ok(())
    }

    fn remove_route(&self, route: RouteId) {
        let mut state = lock(&self.state);
        state.routes.remove(&route);
        state.pending.remove(&route);
    }

    fn write(&self, route: RouteId, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let peer = lock(&self.state).peer.upgrade();
        match peer {
            Some(peer) => {
                peer.deliver(route, frame);
                Ok(())
            }
            None => {
                self.close();
                Err(TransportError::Closed)
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (routes, events, peer) = {
            let mut state = lock(&self.state);
            state.pending.clear();
            (
                std::mem::take(&mut state.routes),
                state.events.take(),
                std::mem::take(&mut state.peer),
            )
        };

        debug!(channel = %self.id, routes = routes.len(), "Memory channel closed");

        for endpoint in routes.into_values() {
            endpoint.on_error(EndpointError::ReadShutdown);
        }
        if let Some(events) = events {
            self.notify(&events, ChannelEvent::Destroyed { channel: self.id });
        }
        if let Some(peer) = peer.upgrade() {
            peer.close();
        }
    }
}
