//! Identifiers shared by every part of the broker.
//!
//! All of these are plain 64-bit values on the wire. The newtypes exist so a
//! pipe id can never be passed where a process id is expected.

use std::fmt;

/// Route id reserved for broker control messages on every routed channel.
pub const BROKER_ROUTE_ID: RouteId = RouteId(1);

/// Process id that names the parent (root) process rather than a child.
pub const PARENT_PROCESS_ID: ProcessId = ProcessId(0);

/// Identifier of one pipe-connection attempt, unique within the process tree.
///
/// Once a pipe is resolved its id doubles as the route id on the channel
/// carrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(pub u64);

impl PipeId {
    /// Generate a fresh random pipe id.
    ///
    /// Never returns a reserved id (see [`PipeId::is_reserved`]).
    pub fn generate() -> Self {
        loop {
            let id: u64 = rand::random();
            let pipe_id = Self(id);
            if !pipe_id.is_reserved() {
                return pipe_id;
            }
        }
    }

    /// Whether this id would collide with the broker control route.
    pub fn is_reserved(self) -> bool {
        self.route() == BROKER_ROUTE_ID
    }

    /// The route id this pipe uses once attached to a channel.
    pub fn route(self) -> RouteId {
        RouteId(self.0)
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of a process in the tree. `0` is the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

impl ProcessId {
    pub fn is_parent(self) -> bool {
        self == PARENT_PROCESS_ID
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Multiplexing key on a routed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(pub u64);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Raw OS-level transport handle.
///
/// The broker never dereferences it; it is only moved between the embedder,
/// the channel factory and the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformHandle(pub u64);

impl fmt::Display for PlatformHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle:{:#x}", self.0)
    }
}

/// Opaque stand-in for a [`PlatformHandle`] issued by the parent's token service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);
