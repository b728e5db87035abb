//! Shared utilities for integration tests.
//!
//! Builds a small process tree over one in-memory transport: a host broker
//! task plus any number of child broker tasks.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use pipe_broker::channel::{ChannelFactory, EventSender, Frame, MemoryTransport, RoutedChannel};
use pipe_broker::endpoint::{EndpointRef, PipeEndpoint};
use pipe_broker::error::{EndpointError, TransportError};
use pipe_broker::runtime::{spawn_child_broker, spawn_host_broker, ChildBrokerHandle, HostBrokerHandle};
use pipe_broker::types::{PlatformHandle, ProcessId, RouteId};
use pipe_broker::Config;

/// How long a test waits for an asynchronous callback.
pub const WAIT: Duration = Duration::from_secs(5);

/// What a test endpoint observed.
pub enum Seen {
    Attached(Arc<dyn RoutedChannel>),
    Message(RouteId, Frame),
    Error(EndpointError),
}

/// Endpoint that reports every callback on a queue.
pub struct TestEndpoint {
    seen: mpsc::UnboundedSender<Seen>,
}

impl TestEndpoint {
    pub fn create() -> (EndpointRef, Observer) {
        let (seen, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { seen }).into(), Observer { rx })
    }
}

impl PipeEndpoint for TestEndpoint {
    fn got_channel(&self, channel: Arc<dyn RoutedChannel>) {
        let _ = self.seen.send(Seen::Attached(channel));
    }

    fn on_message(&self, route: RouteId, frame: Frame) {
        let _ = self.seen.send(Seen::Message(route, frame));
    }

    fn on_error(&self, error: EndpointError) {
        let _ = self.seen.send(Seen::Error(error));
    }
}

/// Receiving side of a `TestEndpoint`.
pub struct Observer {
    rx: mpsc::UnboundedReceiver<Seen>,
}

impl Observer {
    pub async fn next(&mut self) -> Seen {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for endpoint callback")
            .expect("endpoint dropped")
    }

    pub async fn attached(&mut self) -> Arc<dyn RoutedChannel> {
        match self.next().await {
            Seen::Attached(channel) => channel,
            Seen::Message(..) => panic!("expected attach, got message"),
            Seen::Error(e) => panic!("expected attach, got {}", e),
        }
    }

    pub async fn message(&mut self) -> Bytes {
        match self.next().await {
            Seen::Message(_, frame) => frame.payload,
            Seen::Attached(_) => panic!("expected message, got attach"),
            Seen::Error(e) => panic!("expected message, got {}", e),
        }
    }

    pub async fn error(&mut self) -> EndpointError {
        match self.next().await {
            Seen::Error(e) => e,
            Seen::Attached(_) => panic!("expected error, got attach"),
            Seen::Message(..) => panic!("expected error, got message"),
        }
    }

    /// True if nothing is waiting right now.
    pub fn is_quiet(&mut self) -> bool {
        self.rx.try_recv().is_err()
    }
}

/// Channel factory that remembers what one process opened, so a test can
/// kill that process by closing its channels.
pub struct TrackingTransport {
    inner: MemoryTransport,
    opened: Mutex<Vec<Arc<dyn RoutedChannel>>>,
}

impl TrackingTransport {
    pub fn new(inner: MemoryTransport) -> Arc<Self> {
        Arc::new(Self {
            inner,
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn close_all(&self) {
        let opened = std::mem::take(&mut *self.opened.lock().unwrap());
        for channel in opened {
            channel.close();
        }
    }
}

impl ChannelFactory for TrackingTransport {
    fn create_pair(&self) -> Result<(PlatformHandle, PlatformHandle), TransportError> {
        self.inner.create_pair()
    }

    fn open(
        &self,
        handle: PlatformHandle,
        events: EventSender,
    ) -> Result<Arc<dyn RoutedChannel>, TransportError> {
        let channel = self.inner.open(handle, events)?;
        self.opened.lock().unwrap().push(channel.clone());
        Ok(channel)
    }
}

/// A parent broker and its children.
pub struct Tree {
    pub transport: MemoryTransport,
    pub host: HostBrokerHandle,
    children: HashMap<ProcessId, (ChildBrokerHandle, Arc<TrackingTransport>)>,
}

impl Tree {
    pub fn new() -> Self {
        let transport = MemoryTransport::new();
        let (host, _task) = spawn_host_broker(&Config::for_test(), Arc::new(transport.clone()));
        Self {
            transport,
            host,
            children: HashMap::new(),
        }
    }

    /// Launch child `pid` and bootstrap it.
    pub async fn launch(&mut self, pid: u64) -> ChildBrokerHandle {
        let (host_end, child_end) = self.transport.create_pair().unwrap();
        let tracking = TrackingTransport::new(self.transport.clone());
        let (child, _task) = spawn_child_broker(&Config::for_test(), tracking.clone()).unwrap();
        self.host.add_child(ProcessId(pid), host_end).await.unwrap();
        child.set_host_handle(child_end).await.unwrap();
        self.children
            .insert(ProcessId(pid), (child.clone(), tracking));
        child
    }

    /// Launch a child but hold back its bootstrap handle.
    pub async fn launch_unbootstrapped(&mut self, pid: u64) -> (ChildBrokerHandle, PlatformHandle) {
        let (host_end, child_end) = self.transport.create_pair().unwrap();
        let tracking = TrackingTransport::new(self.transport.clone());
        let (child, _task) = spawn_child_broker(&Config::for_test(), tracking.clone()).unwrap();
        self.host.add_child(ProcessId(pid), host_end).await.unwrap();
        self.children
            .insert(ProcessId(pid), (child.clone(), tracking));
        (child, child_end)
    }

    /// Simulate the death of child `pid`: every channel it opened goes away.
    pub fn kill(&mut self, pid: u64) {
        if let Some((_, tracking)) = self.children.remove(&ProcessId(pid)) {
            tracking.close_all();
        }
    }
}
