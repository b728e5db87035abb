//! pipe-broker-sim: in-process simulation of a broker process tree
//!
//! Runs a parent broker and two child brokers over one `MemoryTransport`,
//! then routes pipes between them and pushes a frame through each.
//!
//! ## Topology
//! ```text
//!              [parent]
//!              /      \
//!       [child 7] -- [child 9]
//! ```
//! - pipe A: child 7 <-> child 9 (direct link created on demand)
//! - pipe B: parent <-> child 9 (bootstrap channel)
//! - pipe C: both ends in child 7 (in-process pair)
//!
//! ## Configuration
//! - PIPE_BROKER_CONFIG: path to a YAML config file (optional)
//! - PIPE_BROKER_LOG: tracing filter (default: info)
//! - `broker.sync_channel: true` launches the children sandboxed, each
//!   bootstrapped over a token server on a Unix socket pair

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use pipe_broker::channel::{ChannelFactory, Frame, MemoryTransport, RoutedChannel};
use pipe_broker::endpoint::{EndpointRef, PipeEndpoint};
use pipe_broker::error::EndpointError;
use pipe_broker::runtime::{spawn_child_broker, spawn_host_broker, ChildBrokerHandle};
use pipe_broker::types::{PipeId, PlatformHandle, ProcessId, RouteId};
use pipe_broker::utils::bootstrap::init_tracing;
use pipe_broker::Config;

enum SimEvent {
    Connected(Arc<dyn RoutedChannel>),
    Message(Frame),
    Failed(EndpointError),
}

/// Endpoint that forwards its callbacks to the simulation driver.
struct SimEndpoint {
    name: &'static str,
    events: mpsc::UnboundedSender<SimEvent>,
}

impl SimEndpoint {
    fn create(name: &'static str) -> (EndpointRef, mpsc::UnboundedReceiver<SimEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let endpoint: EndpointRef = Arc::new(Self { name, events }).into();
        (endpoint, rx)
    }
}

impl PipeEndpoint for SimEndpoint {
    fn got_channel(&self, channel: Arc<dyn RoutedChannel>) {
        info!(endpoint = self.name, channel = %channel.id(), "Endpoint attached");
        let _ = self.events.send(SimEvent::Connected(channel));
    }

    fn on_message(&self, route: RouteId, frame: Frame) {
        info!(endpoint = self.name, %route, bytes = frame.payload.len(), "Endpoint received frame");
        let _ = self.events.send(SimEvent::Message(frame));
    }

    fn on_error(&self, error: EndpointError) {
        warn!(endpoint = self.name, error = %error, "Endpoint failed");
        let _ = self.events.send(SimEvent::Failed(error));
    }
}

async fn attached(
    rx: &mut mpsc::UnboundedReceiver<SimEvent>,
) -> Result<Arc<dyn RoutedChannel>, Box<dyn std::error::Error>> {
    match rx.recv().await {
        Some(SimEvent::Connected(channel)) => Ok(channel),
        Some(SimEvent::Failed(e)) => Err(e.into()),
        Some(SimEvent::Message(_)) | None => Err("endpoint was never attached".into()),
    }
}

async fn received(rx: &mut mpsc::UnboundedReceiver<SimEvent>) -> Result<Bytes, Box<dyn std::error::Error>> {
    match rx.recv().await {
        Some(SimEvent::Message(frame)) => Ok(frame.payload),
        Some(SimEvent::Failed(e)) => Err(e.into()),
        Some(SimEvent::Connected(_)) | None => Err("no frame arrived".into()),
    }
}

/// Route `pipe_id` between two endpoints and send one frame from `a` to `b`.
async fn exchange(
    pipe_id: PipeId,
    a: (EndpointRef, mpsc::UnboundedReceiver<SimEvent>),
    b: (EndpointRef, mpsc::UnboundedReceiver<SimEvent>),
    connect_a: impl std::future::Future<Output = pipe_broker::Result<()>>,
    connect_b: impl std::future::Future<Output = pipe_broker::Result<()>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_a, mut a_rx) = a;
    let (_b, mut b_rx) = b;
    connect_a.await?;
    connect_b.await?;

    let channel = attached(&mut a_rx).await?;
    attached(&mut b_rx).await?;

    let payload = Bytes::from(format!("hello over {}", pipe_id));
    channel.write(pipe_id.route(), Frame::new(payload.clone()))?;
    let got = received(&mut b_rx).await?;
    if got != payload {
        return Err(format!("pipe {} delivered the wrong payload", pipe_id).into());
    }
    info!(%pipe_id, "Pipe round trip complete");
    Ok(())
}

/// Start a sandboxed child whose bootstrap handle arrives over a sync pipe
/// served by a token server thread.
#[cfg(unix)]
async fn launch_sandboxed(
    config: &Config,
    transport: &MemoryTransport,
    child_end: PlatformHandle,
) -> Result<ChildBrokerHandle, Box<dyn std::error::Error>> {
    use std::os::unix::net::UnixStream;

    use pipe_broker::runtime::spawn_sandboxed_child_broker;
    use pipe_broker::sync::{IdentityDuplicator, TokenServer, TokenTable};

    let (sync_child, mut sync_parent) = UnixStream::pair()?;
    let server = TokenServer::new(
        TokenTable::new(),
        Arc::new(IdentityDuplicator),
        Arc::new(transport.clone()),
        config.sync.max_handles_per_request,
    );
    std::thread::spawn(move || {
        let served = TokenServer::bootstrap(&mut sync_parent, child_end)
            .and_then(|()| server.serve(&mut sync_parent));
        if let Err(e) = served {
            warn!(error = %e, "Token server stopped");
        }
    });

    let (child, client, _task) =
        spawn_sandboxed_child_broker::<UnixStream>(config, Arc::new(transport.clone()))?;
    child.bootstrap_sandboxed(client, sync_child).await?;
    Ok(child)
}

#[cfg(not(unix))]
async fn launch_sandboxed(
    _config: &Config,
    _transport: &MemoryTransport,
    _child_end: PlatformHandle,
) -> Result<ChildBrokerHandle, Box<dyn std::error::Error>> {
    Err("sandboxed children need Unix socket sync pipes".into())
}

async fn launch_child(
    config: &Config,
    transport: &MemoryTransport,
    host: &pipe_broker::HostBrokerHandle,
    process_id: ProcessId,
) -> Result<ChildBrokerHandle, Box<dyn std::error::Error>> {
    let (host_end, child_end) = transport.create_pair()?;
    host.add_child(process_id, host_end).await?;
    let child = if config.broker.sync_channel {
        launch_sandboxed(config, transport, child_end).await?
    } else {
        let (child, _task) = spawn_child_broker(config, Arc::new(transport.clone()))?;
        child.set_host_handle(child_end).await?;
        child
    };
    info!(%process_id, sandboxed = config.broker.sync_channel, "Child launched");
    Ok(child)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let transport = MemoryTransport::new();
    let (host, _host_task) = spawn_host_broker(&config, Arc::new(transport.clone()));

    let seven = launch_child(&config, &transport, &host, ProcessId(7)).await?;
    let nine = launch_child(&config, &transport, &host, ProcessId(9)).await?;

    // Pipe A: child to child.
    let pipe = PipeId::generate();
    let x = SimEndpoint::create("x@7");
    let y = SimEndpoint::create("y@9");
    let (x_ref, y_ref) = (x.0.clone(), y.0.clone());
    exchange(pipe, x, y, seven.connect(pipe, x_ref), nine.connect(pipe, y_ref)).await?;

    // Pipe B: parent to child.
    let pipe = PipeId::generate();
    let p = SimEndpoint::create("p@0");
    let w = SimEndpoint::create("w@9");
    let (p_ref, w_ref) = (p.0.clone(), w.0.clone());
    exchange(pipe, p, w, host.connect(pipe, p_ref), nine.connect(pipe, w_ref)).await?;

    // Pipe C: both ends local to child 7.
    let pipe = PipeId::generate();
    let l = SimEndpoint::create("l@7");
    let r = SimEndpoint::create("r@7");
    let (l_ref, r_ref) = (l.0.clone(), r.0.clone());
    exchange(pipe, l, r, seven.connect(pipe, l_ref), seven.connect(pipe, r_ref)).await?;

    info!(
        unclaimed = transport.unclaimed_handles(),
        "Simulation finished"
    );
    Ok(())
}
