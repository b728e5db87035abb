//! Pipe broker - control plane for message pipes in a process tree.
//!
//! A parent process launches children. Each endpoint of a message pipe asks
//! its local broker to connect a pipe id; the brokers find out where the
//! other end lives and attach both endpoints to a routed channel between
//! the two processes (or to an in-process channel pair when both ends turn
//! out to be local).
//!
//! - [`child::ChildBroker`]: per-child connect/cancel/resolve state machine
//! - [`host::HostBroker`]: parent-side matching across all children
//! - [`sync`]: blocking token service used by sandboxed children
//! - [`runtime`]: tokio tasks that own the brokers

pub mod channel;
pub mod child;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod host;
pub mod messages;
pub mod queue;
pub mod runtime;
pub mod sync;
pub mod types;
pub mod utils;

#[cfg(test)]
pub mod test_utils;

pub use channel::{ChannelEvent, ChannelFactory, ChannelId, Frame, MemoryTransport, RoutedChannel};
pub use child::ChildBroker;
pub use config::Config;
pub use endpoint::{EndpointRef, PipeEndpoint};
pub use error::{BrokerError, EndpointError, Result, TransportError};
pub use host::{ChildBrokerHost, HostBroker};
pub use messages::BrokerMessage;
pub use runtime::{
    spawn_child_broker, spawn_host_broker, spawn_sandboxed_child_broker, ChildBrokerHandle,
    HostBrokerHandle,
};
pub use types::{PipeId, PlatformHandle, ProcessId, RouteId, Token, BROKER_ROUTE_ID, PARENT_PROCESS_ID};
