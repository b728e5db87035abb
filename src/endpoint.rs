//! Local pipe endpoints as seen by the broker.
//!
//! The broker never inspects an endpoint. It only hands it a channel, routes
//! frames to it, and reports errors. Endpoints are keyed by identity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use crate::channel::{Frame, RoutedChannel};
use crate::error::EndpointError;
use crate::types::RouteId;

/// One side of a message pipe living in this process.
pub trait PipeEndpoint: Send + Sync {
    /// The pipe now runs over `channel`; writes go out on the pipe's route.
    fn got_channel(&self, channel: Arc<dyn RoutedChannel>);

    /// A frame arrived on this endpoint's route.
    fn on_message(&self, route: RouteId, frame: Frame);

    /// Terminal error. No further frames will arrive.
    fn on_error(&self, error: EndpointError);
}

/// Shared endpoint reference with identity semantics for map keys.
#[derive(Clone)]
pub struct EndpointRef(Arc<dyn PipeEndpoint>);

impl EndpointRef {
    pub fn new(endpoint: Arc<dyn PipeEndpoint>) -> Self {
        Self(endpoint)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl<T: PipeEndpoint + 'static> From<Arc<T>> for EndpointRef {
    fn from(endpoint: Arc<T>) -> Self {
        Self(endpoint)
    }
}

impl Deref for EndpointRef {
    type Target = dyn PipeEndpoint;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for EndpointRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for EndpointRef {}

impl Hash for EndpointRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointRef({:#x})", self.addr())
    }
}
