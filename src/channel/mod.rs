//! Routed channels: the transport seam under the broker.
//!
//! A routed channel multiplexes many logical routes over one physical
//! connection. Frames on [`BROKER_ROUTE_ID`](crate::types::BROKER_ROUTE_ID) are handed to the owning broker
//! as [`ChannelEvent`]s on its I/O queue; frames on any other route go to the
//! endpoint registered for it.
//!
//! Implementations:
//! - `MemoryTransport`: in-process channel pairs (shortcut pairs, tests, simulator)

pub mod memory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::endpoint::EndpointRef;
use crate::error::TransportError;
use crate::types::{PlatformHandle, RouteId};

pub use memory::MemoryTransport;

/// Process-local identity of an opened channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl ChannelId {
    /// Allocate a fresh id, unique for the lifetime of the process.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// One message on a route: bytes plus any transferred handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    pub handles: Vec<PlatformHandle>,
}

impl Frame {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            handles: Vec::new(),
        }
    }

    pub fn with_handles(payload: Bytes, handles: Vec<PlatformHandle>) -> Self {
        Self { payload, handles }
    }
}

/// What a channel reports to the broker that owns it.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A frame arrived on the broker route.
    Message { channel: ChannelId, frame: Frame },
    /// The channel is gone. Sent exactly once per channel.
    Destroyed { channel: ChannelId },
}

/// Sending half of a broker's I/O event queue.
pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;
/// Receiving half of a broker's I/O event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// Create an I/O event queue.
pub fn event_queue() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// A multiplexing transport between two processes.
pub trait RoutedChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Deliver frames on `route` to `endpoint`.
    ///
    /// Frames that arrived on the route before it was added are flushed to the
    /// endpoint in arrival order. A closed channel refuses the route with
    /// `TransportError::Closed` and never calls the endpoint.
    fn add_route(&self, route: RouteId, endpoint: EndpointRef) -> Result<(), TransportError>;

    fn remove_route(&self, route: RouteId);

    /// Send a frame to the peer on `route`.
    fn write(&self, route: RouteId, frame: Frame) -> Result<(), TransportError>;

    /// Shut the channel down. Idempotent.
    ///
    /// Every attached endpoint sees `ReadShutdown`, and the owning broker
    /// receives one `ChannelEvent::Destroyed`.
    fn close(&self);
}

/// Creates and opens routed channels from raw transport handles.
pub trait ChannelFactory: Send + Sync {
    /// Create a connected pair of transport handles.
    fn create_pair(&self) -> Result<(PlatformHandle, PlatformHandle), TransportError>;

    /// Take ownership of `handle` and wrap it in a routed channel whose
    /// broker-route traffic and destruction go to `events`.
    fn open(
        &self,
        handle: PlatformHandle,
        events: EventSender,
    ) -> Result<Arc<dyn RoutedChannel>, TransportError>;
}

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
